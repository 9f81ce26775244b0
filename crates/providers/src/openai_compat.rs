//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, DeepSeek, and any other
//! endpoint that follows the OpenAI chat-completions contract.

use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use crate::util::{from_reqwest, from_status, parse_retry_after};
use ag_domain::config::ApiConfig;
use ag_domain::error::{Error, Result};
use ag_domain::message::{ChatMessage, Role, ToolCallRequest, ToolDefinition};
use ag_domain::stream::{BoxStream, StreamEvent, Usage};
use serde_json::Value;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM adapter for any OpenAI-compatible chat-completions endpoint.
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Build from the effective `api` section of a config snapshot.
    pub fn from_api_config(cfg: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: "openai_compat".into(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            default_model: cfg.model.clone(),
            client,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn msg_to_openai(msg: &ChatMessage) -> Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        }),
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.call_id,
                        "type": "function",
                        "function": {
                            "name": tc.tool_name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            serde_json::json!({
                "role": "assistant",
                "content": if msg.content.is_empty() { Value::Null } else { Value::String(msg.content.clone()) },
                "tool_calls": calls,
            })
        }
        _ => serde_json::json!({
            "role": msg.role.as_str(),
            "content": msg.content,
        }),
    }
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: "openai_compat".into(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: "openai_compat".into(),
        message: "no message in choice".into(),
    })?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(String::from);

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    Ok(ChatResponse {
        content,
        tool_calls: parse_tool_calls(message),
        usage: body.get("usage").and_then(parse_usage),
        model,
        finish_reason,
    })
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCallRequest> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let call_id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let tool_name = func.get("name")?.as_str()?.to_string();
            let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
            let arguments: Value =
                serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ToolCallRequest {
                call_id,
                tool_name,
                arguments,
            })
        })
        .collect()
}

fn parse_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE body decoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Incremental decoder for the chat-completions SSE body.
///
/// Line-oriented on purpose: this wire format carries exactly one JSON
/// payload per `data:` line, so a complete line is enough to act on — no
/// event-block reassembly. `event:`, `id:`, `retry:`, comments, and the
/// blank separator lines carry nothing we use and are skipped.
#[derive(Default)]
struct SseLineDecoder {
    buf: String,
}

impl SseLineDecoder {
    /// Feed arriving bytes; returns the payloads of every `data:` line the
    /// bytes completed. A trailing partial line waits for more input.
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));

        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload.to_string());
            }
        }
        payloads
    }

    /// The body ended. A final unterminated `data:` line still counts.
    fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buf);
        data_payload(&line).map(str::to_string)
    }
}

/// Extract the payload of a `data:` line, or `None` for anything else.
/// Whitespace around the payload and the CR of CRLF endings are noise; an
/// empty payload is treated as no payload at all.
fn data_payload(line: &str) -> Option<&str> {
    let payload = line.trim().strip_prefix("data:")?.trim();
    (!payload.is_empty()).then_some(payload)
}

/// One `data:` payload → at most one typed event. `[DONE]` is the OpenAI
/// end-of-stream sentinel.
fn payload_event(payload: &str) -> Option<Result<StreamEvent>> {
    if payload == "[DONE]" {
        return Some(Ok(StreamEvent::Done {
            usage: None,
            finish_reason: Some("stop".into()),
        }));
    }
    parse_sse_data(payload)
}

/// Drive the response body through the decoder, translating payloads into
/// typed deltas. A transport error mid-body surfaces once and ends the
/// stream; if the provider never sent an end marker, a fallback `Done` is
/// appended so consumers always observe termination.
fn stream_events(response: reqwest::Response) -> BoxStream<'static, Result<StreamEvent>> {
    Box::pin(async_stream::stream! {
        let mut response = response;
        let mut decoder = SseLineDecoder::default();
        let mut done_seen = false;

        loop {
            let payloads = match response.chunk().await {
                Ok(Some(bytes)) => decoder.feed(&bytes),
                Ok(None) => {
                    if let Some(payload) = decoder.finish() {
                        if let Some(event) = payload_event(&payload) {
                            done_seen |= matches!(&event, Ok(StreamEvent::Done { .. }));
                            yield event;
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            };

            for payload in payloads {
                if let Some(event) = payload_event(&payload) {
                    done_seen |= matches!(&event, Ok(StreamEvent::Done { .. }));
                    yield event;
                }
            }
        }

        if !done_seen {
            yield Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            });
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delta classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_sse_data(data: &str) -> Option<Result<StreamEvent>> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(Err(Error::Json(e))),
    };

    let choice = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first());

    // Usage-only chunk (stream_options.include_usage).
    if choice.is_none() {
        if let Some(usage) = v.get("usage").and_then(parse_usage) {
            return Some(Ok(StreamEvent::Done {
                usage: Some(usage),
                finish_reason: None,
            }));
        }
        return None;
    }

    let choice = choice?;
    let delta = choice.get("delta").unwrap_or(&Value::Null);

    if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        let usage = v.get("usage").and_then(parse_usage);
        return Some(Ok(StreamEvent::Done {
            usage,
            finish_reason: Some(fr.to_string()),
        }));
    }

    // Tool call deltas. The first fragment of a call carries `id` + name;
    // later fragments only carry `index` + argument text.
    if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tc_arr {
            let idx_str = tc
                .get("index")
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
                .to_string();

            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                let name = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                return Some(Ok(StreamEvent::ToolCallStarted {
                    call_id: id.to_string(),
                    tool_name: name.to_string(),
                }));
            }

            if let Some(args) = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str())
            {
                return Some(Ok(StreamEvent::ToolCallDelta {
                    call_id: idx_str,
                    delta: args.to_string(),
                }));
            }
        }
    }

    // Text content delta.
    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            return Some(Ok(StreamEvent::Token {
                text: text.to_string(),
            }));
        }
    }

    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = self.chat_url();
        let body = self.build_chat_body(req, false);

        tracing::debug!(provider = %self.id, url = %url, "chat request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers().get("retry-after"));
            let text = resp.text().await.unwrap_or_default();
            return Err(from_status(&self.id, status, retry_after, &text));
        }

        let resp_json: Value = resp.json().await.map_err(from_reqwest)?;
        parse_chat_response(&resp_json)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = self.chat_url();
        let body = self.build_chat_body(req, true);

        tracing::debug!(provider = %self.id, url = %url, "stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers().get("retry-after"));
            let text = resp.text().await.unwrap_or_default();
            return Err(from_status(&self.id, status, retry_after, &text));
        }

        Ok(stream_events(resp))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider::from_api_config(&ApiConfig {
            api_key: "sk-test".into(),
            base_url: "http://localhost:9999/v1".into(),
            model: "test-model".into(),
            ..ApiConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn body_includes_model_and_stream_options() {
        let p = provider();
        let req = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            ..ChatRequest::default()
        };
        let body = p.build_chat_body(&req, true);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn model_override_wins() {
        let p = provider();
        let req = ChatRequest {
            model: Some("other-model".into()),
            ..ChatRequest::default()
        };
        assert_eq!(p.build_chat_body(&req, false)["model"], "other-model");
    }

    #[test]
    fn assistant_tool_call_round_trips_to_wire_shape() {
        let msg = ChatMessage::assistant_with_calls(
            "",
            vec![ToolCallRequest {
                call_id: "call_1".into(),
                tool_name: "web.fetch".into(),
                arguments: serde_json::json!({"url": "https://example.com"}),
            }],
        );
        let wire = msg_to_openai(&msg);
        assert_eq!(wire["role"], "assistant");
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "web.fetch");
    }

    #[test]
    fn tool_result_carries_call_id() {
        let wire = msg_to_openai(&ChatMessage::tool_result("call_1", "ok"));
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_1");
    }

    // ── SSE line decoder ───────────────────────────────────────────

    #[test]
    fn decoder_yields_one_payload_per_complete_line() {
        let mut decoder = SseLineDecoder::default();
        let payloads = decoder.feed(b"data: {\"hello\":\"world\"}\n\ndata: second\n");
        assert_eq!(payloads, vec!["{\"hello\":\"world\"}", "second"]);
    }

    #[test]
    fn decoder_holds_partial_lines_across_chunks() {
        let mut decoder = SseLineDecoder::default();
        assert!(decoder.feed(b"data: spl").is_empty());
        assert_eq!(decoder.feed(b"it\ndata: next\n"), vec!["split", "next"]);
    }

    #[test]
    fn decoder_empty_input_yields_nothing() {
        let mut decoder = SseLineDecoder::default();
        assert!(decoder.feed(b"").is_empty());
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn decoder_skips_empty_data_payloads() {
        let mut decoder = SseLineDecoder::default();
        assert!(decoder.feed(b"data: \n").is_empty());
        assert!(decoder.feed(b"data:\n").is_empty());
    }

    #[test]
    fn decoder_trims_whitespace_around_the_payload() {
        let mut decoder = SseLineDecoder::default();
        let payloads = decoder.feed(b"data:   {\"key\":\"val\"}  \n");
        assert_eq!(payloads, vec!["{\"key\":\"val\"}"]);
    }

    #[test]
    fn decoder_ignores_non_data_fields() {
        let mut decoder = SseLineDecoder::default();
        let payloads = decoder.feed(b"event: ping\nid: 42\nretry: 5000\n: comment\ndata: payload\n");
        assert_eq!(payloads, vec!["payload"]);
    }

    #[test]
    fn decoder_handles_crlf_line_endings() {
        let mut decoder = SseLineDecoder::default();
        let payloads = decoder.feed(b"data: windows\r\n");
        assert_eq!(payloads, vec!["windows"]);
    }

    #[test]
    fn decoder_finish_flushes_an_unterminated_line() {
        let mut decoder = SseLineDecoder::default();
        assert!(decoder.feed(b"data: tail").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
        // A second finish has nothing left.
        assert!(decoder.finish().is_none());
    }

    // ── delta classification ───────────────────────────────────────

    #[test]
    fn sse_text_delta_parses_to_token() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert!(matches!(
            payload_event(data),
            Some(Ok(StreamEvent::Token { text })) if text == "Hel"
        ));
    }

    #[test]
    fn sse_tool_call_start_and_delta_parse() {
        let start = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"shell.exec","arguments":""}}]}}]}"#;
        assert!(matches!(
            payload_event(start),
            Some(Ok(StreamEvent::ToolCallStarted { call_id, tool_name }))
                if call_id == "call_9" && tool_name == "shell.exec"
        ));

        let delta = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"cmd\""}}]}}]}"#;
        assert!(matches!(
            payload_event(delta),
            Some(Ok(StreamEvent::ToolCallDelta { call_id, delta }))
                if call_id == "0" && delta == "{\"cmd\""
        ));
    }

    #[test]
    fn sse_done_sentinel_and_finish_reason() {
        assert!(matches!(
            payload_event("[DONE]"),
            Some(Ok(StreamEvent::Done { .. }))
        ));

        let finish = r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#;
        assert!(matches!(
            payload_event(finish),
            Some(Ok(StreamEvent::Done { finish_reason: Some(r), .. })) if r == "tool_calls"
        ));
    }

    #[test]
    fn sse_usage_only_chunk_yields_done_with_usage() {
        let data = r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        assert!(matches!(
            payload_event(data),
            Some(Ok(StreamEvent::Done { usage: Some(u), .. })) if u.total_tokens == 15
        ));
    }

    #[test]
    fn non_streaming_response_parses() {
        let body = serde_json::json!({
            "model": "test-model",
            "choices": [{
                "message": {"content": "hello", "tool_calls": [
                    {"id": "c1", "function": {"name": "time.now", "arguments": "{}"}}
                ]},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
        });
        let parsed = parse_chat_response(&body).unwrap();
        assert_eq!(parsed.content, "hello");
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].tool_name, "time.now");
        assert_eq!(parsed.usage.unwrap().total_tokens, 3);
    }
}
