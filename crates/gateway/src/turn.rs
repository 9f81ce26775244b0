//! The turn engine: prompt assembly, streamed LLM consumption, tool-call
//! interleave, confirmation gating, and the commit.
//!
//! Per-turn state machine: `scheduled → streaming → (suspended_for_tool ↔
//! streaming)* → normalizing → committed | aborted | failed`. A suspension
//! serializes the partial turn into the confirmation store and ends the
//! worker task; approval builds a fresh task from that value — no coroutine
//! lives across user think-time.
//!
//! The engine surfaces its own user-visible failures (frames + a single
//! `conversation.error`) and returns `Ok(Failed)`. It returns `Err` only
//! for retriable errors that occurred before anything was streamed, which
//! is the scheduler's cue to back off and retry the whole item.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use serde_json::{json, Value};

use ag_domain::config::ConfigSnapshot;
use ag_domain::error::{Error, Result};
use ag_domain::message::{ChatMessage, Role, ToolCallRequest};
use ag_domain::stream::StreamEvent;
use ag_memory::{MemoryCandidate, MemoryService};
use ag_providers::{ChatRequest, LlmProvider};
use ag_sessions::store::CommittedToolMessage;
use ag_sessions::{DailyLogWriter, SessionStore, TurnHandle};
use ag_tools::{definitions_for, ToolContext, ToolPolicy, ToolRunner};

use crate::bus::{EventBus, EventKind};
use crate::config_service::ConfigService;
use crate::confirm::{ConfirmStore, PendingConfirmation, SuspendedTurn};
use crate::dedup::normalize_final_text;
use crate::frames::{self, FrameSink};
use crate::scheduler::{TurnOutcome, TurnRunner, WorkItem, WorkKind};

/// Builds the provider for a turn from its snapshot. Injectable so tests
/// can script the stream.
pub type ProviderFactory =
    Box<dyn Fn(&ConfigSnapshot) -> Result<Arc<dyn LlmProvider>> + Send + Sync>;

pub struct TurnEngine {
    config: Arc<ConfigService>,
    sessions: Arc<SessionStore>,
    memory: Arc<MemoryService>,
    tools: Arc<ToolRunner>,
    confirm: Arc<ConfirmStore>,
    logbook: Arc<DailyLogWriter>,
    bus: EventBus,
    cancelled: Arc<AtomicBool>,
    provider_factory: ProviderFactory,
}

/// Mutable state of one in-flight turn.
struct TurnState {
    turn: TurnHandle,
    snapshot: Arc<ConfigSnapshot>,
    messages: Vec<ChatMessage>,
    /// Assistant text accumulated across hops (pre-normalization).
    answer: String,
    tool_messages: Vec<CommittedToolMessage>,
    hops: u32,
    frames: FrameSink,
    stream: bool,
    streamed_any: bool,
}

#[allow(clippy::too_many_arguments)]
impl TurnEngine {
    pub fn new(
        config: Arc<ConfigService>,
        sessions: Arc<SessionStore>,
        memory: Arc<MemoryService>,
        tools: Arc<ToolRunner>,
        confirm: Arc<ConfirmStore>,
        logbook: Arc<DailyLogWriter>,
        bus: EventBus,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            sessions,
            memory,
            tools,
            confirm,
            logbook,
            bus,
            cancelled,
            provider_factory: Box::new(|snapshot| ag_providers::provider_for(snapshot)),
        }
    }

    /// Swap the provider factory (tests).
    pub fn with_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.provider_factory = factory;
        self
    }

    // ── message turns ────────────────────────────────────────────────

    async fn run_message(&self, item: &WorkItem, text: &str, stream: bool) -> Result<TurnOutcome> {
        let snapshot = self.config.for_user(&item.user_id);
        let started = Instant::now();

        self.bus.emit(
            EventKind::ConversationStart,
            json!({"user_id": item.user_id, "session_id": item.session_id}),
        );

        let turn = self
            .sessions
            .begin_turn(&item.user_id, &item.session_id, text)?;

        // Recall runs under its own deadline and silently skips on miss.
        let recall_block = self
            .memory
            .recall(&item.user_id, &item.session_id, text)
            .await;

        let mut system_prompt = snapshot.system_prompt.clone();
        if let Some(block) = recall_block {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(&block);
        }

        let mut messages = vec![ChatMessage::system(system_prompt)];
        for (role, content) in self.sessions.recent_history(
            &item.user_id,
            &item.session_id,
            snapshot.config.sessions.history_rounds,
        ) {
            messages.push(ChatMessage {
                role,
                content,
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }
        messages.push(ChatMessage::user(text));

        tracing::debug!(
            user_id = %item.user_id,
            session_id = %item.session_id,
            prompt_messages = messages.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "prompt assembled"
        );

        let state = TurnState {
            turn,
            snapshot,
            messages,
            answer: String::new(),
            tool_messages: Vec::new(),
            hops: 0,
            frames: item.frames.clone(),
            stream,
            streamed_any: false,
        };
        self.run_hops(state, VecDeque::new()).await
    }

    // ── resume turns ─────────────────────────────────────────────────

    async fn run_resume(
        &self,
        pending: &Arc<parking_lot::Mutex<Option<PendingConfirmation>>>,
        approve: bool,
    ) -> Result<TurnOutcome> {
        let Some(pending) = pending.lock().take() else {
            return Err(Error::NotFound("pending confirmation already consumed".into()));
        };

        let PendingConfirmation {
            call_id,
            tool_name,
            suspended,
            ..
        } = pending;
        let SuspendedTurn {
            turn,
            snapshot,
            messages,
            answer,
            tool_messages,
            mut pending_calls,
            hops_used,
            frames,
            stream,
        } = suspended;

        let mut state = TurnState {
            turn,
            snapshot,
            messages,
            answer,
            tool_messages,
            hops: hops_used,
            frames,
            stream,
            streamed_any: true,
        };

        let Some(call) = pending_calls.pop_front() else {
            return Err(Error::Internal(format!(
                "suspended turn lost its pending call {call_id}"
            )));
        };

        if approve {
            let policy = ToolPolicy::from_snapshot(&state.snapshot);
            self.execute_call(&mut state, &call, &policy).await;
        } else {
            // Rejection becomes a synthetic tool result; the model gets to
            // react to it. No tool side effect happened.
            let result_text = "rejected by user";
            state
                .frames
                .send(frames::tool_result(&call.call_id, &tool_name, result_text))
                .await;
            self.bus.emit(
                EventKind::StreamToolResult,
                json!({
                    "user_id": state.turn.user_id,
                    "session_id": state.turn.session_id,
                    "call_id": call.call_id,
                    "tool_name": tool_name,
                    "result": result_text,
                    "status": "rejected",
                }),
            );
            state
                .messages
                .push(ChatMessage::tool_result(&call.call_id, result_text));
            state.tool_messages.push(CommittedToolMessage {
                call,
                content: result_text.to_string(),
            });
        }

        self.run_hops(state, pending_calls).await
    }

    // ── the hop loop ─────────────────────────────────────────────────

    /// Drain pending tool calls, then stream the next LLM response;
    /// repeat until the model answers without tools, the turn suspends,
    /// or a limit trips.
    async fn run_hops(
        &self,
        mut state: TurnState,
        mut queue: VecDeque<ToolCallRequest>,
    ) -> Result<TurnOutcome> {
        let policy = ToolPolicy::from_snapshot(&state.snapshot);

        loop {
            // 1. Tool phase.
            while let Some(call) = queue.pop_front() {
                if self.cancelled.load(Ordering::Relaxed) {
                    return Ok(self.cancel(state).await);
                }

                if policy.needs_confirmation(&call.tool_name) {
                    return Ok(self.suspend(state, call, queue).await);
                }
                self.execute_call(&mut state, &call, &policy).await;
            }

            if self.cancelled.load(Ordering::Relaxed) {
                return Ok(self.cancel(state).await);
            }

            // 2. LLM phase.
            let provider = match (self.provider_factory)(&state.snapshot) {
                Ok(p) => p,
                Err(e) => return Ok(self.fail(state, e).await),
            };
            let request = ChatRequest {
                messages: state.messages.clone(),
                tools: definitions_for(&self.tools, &policy),
                temperature: Some(state.snapshot.config.api.temperature),
                max_tokens: Some(state.snapshot.config.api.max_tokens),
                model: None,
            };

            let mut llm_stream = match provider.chat_stream(&request).await {
                Ok(s) => s,
                Err(e) if e.is_retriable() && !state.streamed_any => {
                    // Nothing reached the client yet: hand back to the
                    // scheduler for backoff + retry with a fresh turn.
                    self.sessions.abort_turn(state.turn);
                    return Err(e);
                }
                Err(e) => return Ok(self.fail(state, e).await),
            };

            let mut segment = String::new();
            // (call_id, tool_name, argument buffer), in arrival order.
            let mut assembling: Vec<(String, String, String)> = Vec::new();

            while let Some(event) = llm_stream.next().await {
                match event {
                    Ok(StreamEvent::Token { text }) => {
                        state.streamed_any = true;
                        segment.push_str(&text);
                        state.frames.send(frames::text(&text)).await;
                        self.bus.emit(
                            EventKind::StreamText,
                            json!({
                                "user_id": state.turn.user_id,
                                "session_id": state.turn.session_id,
                                "content": text,
                            }),
                        );
                    }
                    Ok(StreamEvent::ToolCallStarted { call_id, tool_name }) => {
                        assembling.push((call_id, tool_name, String::new()));
                    }
                    Ok(StreamEvent::ToolCallDelta { call_id, delta }) => {
                        // OpenAI keys deltas by index once the id has been
                        // announced; fall back to the call being assembled.
                        if let Some(slot) =
                            assembling.iter_mut().find(|(id, _, _)| *id == call_id)
                        {
                            slot.2.push_str(&delta);
                        } else if let Some(last) = assembling.last_mut() {
                            last.2.push_str(&delta);
                        }
                    }
                    Ok(StreamEvent::Done { .. }) => break,
                    Ok(StreamEvent::Error { message }) => {
                        let err = Error::Provider {
                            provider: provider.provider_id().to_string(),
                            message,
                        };
                        return Ok(self.fail(state, err).await);
                    }
                    Err(e) if e.is_retriable() && !state.streamed_any => {
                        self.sessions.abort_turn(state.turn);
                        return Err(e);
                    }
                    Err(e) => return Ok(self.fail(state, e).await),
                }
            }

            let calls: Vec<ToolCallRequest> = assembling
                .into_iter()
                .map(|(call_id, tool_name, args)| ToolCallRequest {
                    call_id,
                    tool_name,
                    arguments: parse_call_arguments(&args),
                })
                .collect();

            // 3. Final answer: normalize, commit, notify.
            if calls.is_empty() {
                append_segment(&mut state.answer, &segment);
                return self.commit(state).await;
            }

            // 4. Another hop.
            state.hops += 1;
            if state.hops > state.snapshot.config.scheduler.tool_hops_max {
                let limit = state.snapshot.config.scheduler.tool_hops_max;
                return Ok(self.fail(state, Error::ToolLoopLimit(limit)).await);
            }

            append_segment(&mut state.answer, &segment);
            state
                .messages
                .push(ChatMessage::assistant_with_calls(segment, calls.clone()));

            for call in &calls {
                state
                    .frames
                    .send(frames::tool_detected(&call.tool_name))
                    .await;
                self.bus.emit(
                    EventKind::StreamToolDetected,
                    json!({
                        "user_id": state.turn.user_id,
                        "session_id": state.turn.session_id,
                        "call_id": call.call_id,
                        "tool_name": call.tool_name,
                    }),
                );
            }
            queue = VecDeque::from(calls);
        }
    }

    // ── single tool execution ────────────────────────────────────────

    async fn execute_call(
        &self,
        state: &mut TurnState,
        call: &ToolCallRequest,
        policy: &ToolPolicy,
    ) {
        let user_id = state.turn.user_id.clone();
        let session_id = state.turn.session_id.clone();

        state
            .frames
            .send(frames::tool_start(
                &call.call_id,
                &call.tool_name,
                &call.arguments,
                "running",
            ))
            .await;
        let call_payload = json!({
            "user_id": user_id,
            "session_id": session_id,
            "call_id": call.call_id,
            "tool_name": call.tool_name,
        });
        self.bus
            .emit(EventKind::StreamToolStart, call_payload.clone());
        self.bus.emit(EventKind::ToolCallStart, call_payload.clone());

        let ctx = ToolContext {
            user_id,
            session_id,
            request_id: None,
        };
        let envelope = self
            .tools
            .invoke(&call.tool_name, call.arguments.clone(), &ctx, policy)
            .await;
        let result_text = envelope.as_prompt_text();

        if envelope.ok {
            state
                .frames
                .send(frames::tool_result(
                    &call.call_id,
                    &call.tool_name,
                    &result_text,
                ))
                .await;
            self.bus
                .emit(EventKind::StreamToolResult, call_payload.clone());
            self.bus.emit(EventKind::ToolCallResult, call_payload);
        } else {
            state
                .frames
                .send(frames::tool_error(&call.call_id, &result_text))
                .await;
            self.bus
                .emit(EventKind::StreamToolError, call_payload.clone());
            self.bus.emit(EventKind::ToolCallError, call_payload);
        }

        state
            .messages
            .push(ChatMessage::tool_result(&call.call_id, &result_text));
        state.tool_messages.push(CommittedToolMessage {
            call: call.clone(),
            content: result_text,
        });
    }

    // ── terminal transitions ─────────────────────────────────────────

    async fn commit(&self, state: TurnState) -> Result<TurnOutcome> {
        let TurnState {
            turn,
            snapshot,
            answer,
            tool_messages,
            frames: sink,
            ..
        } = state;

        let user_id = turn.user_id.clone();
        let session_id = turn.session_id.clone();
        let user_text = turn.user_text.clone();
        let final_text = normalize_final_text(&answer);

        let turn_index = self.sessions.commit_turn(turn, &final_text, &tool_messages)?;

        sink.send(frames::done(&session_id, &final_text)).await;
        self.bus.emit(
            EventKind::ConversationComplete,
            json!({
                "user_id": user_id,
                "session_id": session_id,
                "turn_index": turn_index,
                "response_chars": final_text.chars().count(),
            }),
        );

        // Write-behind: the turn is done regardless of what memory does.
        self.memory.ingest(MemoryCandidate {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            user_text: user_text.clone(),
            assistant_text: final_text.clone(),
            timestamp: chrono::Utc::now(),
        });

        if let Err(e) = self.logbook.append_turn(
            &user_id,
            &snapshot.config.api.model,
            &user_text,
            &final_text,
        ) {
            tracing::warn!(user_id = %user_id, error = %e, "conversation log append failed");
        }

        Ok(TurnOutcome::Committed)
    }

    async fn suspend(
        &self,
        state: TurnState,
        call: ToolCallRequest,
        rest: VecDeque<ToolCallRequest>,
    ) -> TurnOutcome {
        let TurnState {
            turn,
            snapshot,
            messages,
            answer,
            tool_messages,
            hops,
            frames: sink,
            stream,
            ..
        } = state;

        sink.send(frames::tool_start(
            &call.call_id,
            &call.tool_name,
            &call.arguments,
            "awaiting_confirm",
        ))
        .await;
        self.bus.emit(
            EventKind::StreamToolStart,
            json!({
                "user_id": turn.user_id,
                "session_id": turn.session_id,
                "call_id": call.call_id,
                "tool_name": call.tool_name,
                "status": "awaiting_confirm",
            }),
        );

        let mut pending_calls = rest;
        pending_calls.push_front(call.clone());

        self.confirm.insert(PendingConfirmation {
            call_id: call.call_id.clone(),
            user_id: turn.user_id.clone(),
            session_id: turn.session_id.clone(),
            tool_name: call.tool_name,
            arguments: call.arguments,
            created_at: Instant::now(),
            suspended: SuspendedTurn {
                turn,
                snapshot,
                messages,
                answer,
                tool_messages,
                pending_calls,
                hops_used: hops,
                frames: sink,
                stream,
            },
        });

        TurnOutcome::Suspended
    }

    async fn fail(&self, state: TurnState, error: Error) -> TurnOutcome {
        tracing::error!(
            user_id = %state.turn.user_id,
            session_id = %state.turn.session_id,
            kind = error.kind(),
            error = %error,
            "turn failed"
        );
        state.frames.send(frames::error(&error.user_message())).await;
        self.bus.emit(
            EventKind::ConversationError,
            json!({
                "user_id": state.turn.user_id,
                "session_id": state.turn.session_id,
                "kind": error.kind(),
            }),
        );
        self.sessions.abort_turn(state.turn);
        TurnOutcome::Failed
    }

    async fn cancel(&self, state: TurnState) -> TurnOutcome {
        state
            .frames
            .send(frames::error(&Error::Cancelled("shutdown".into()).user_message()))
            .await;
        self.bus.emit(
            EventKind::ConversationError,
            json!({
                "user_id": state.turn.user_id,
                "session_id": state.turn.session_id,
                "kind": "cancelled",
            }),
        );
        self.sessions.abort_turn(state.turn);
        TurnOutcome::Aborted
    }
}

#[async_trait::async_trait]
impl TurnRunner for TurnEngine {
    async fn run(&self, item: WorkItem) -> Result<TurnOutcome> {
        use tracing::Instrument;

        let span = tracing::info_span!(
            "turn",
            user_id = %item.user_id,
            session_id = %item.session_id,
            attempt = item.attempt,
        );
        match item.kind.clone() {
            WorkKind::Message { text, stream } => {
                self.run_message(&item, &text, stream).instrument(span).await
            }
            WorkKind::Resume { pending, approve } => {
                self.run_resume(&pending, approve).instrument(span).await
            }
        }
    }
}

fn parse_call_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "tool call arguments are not valid JSON, using empty object");
            Value::Object(Default::default())
        }
    }
}

fn append_segment(answer: &mut String, segment: &str) {
    let segment = segment.trim();
    if segment.is_empty() {
        return;
    }
    if !answer.is_empty() {
        answer.push_str("\n\n");
    }
    answer.push_str(segment);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
