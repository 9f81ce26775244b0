//! Chat endpoints: the streamed turn surface, confirmation resolution,
//! and the quick-followup helper.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use ag_domain::error::Error;
use ag_domain::message::ChatMessage;
use ag_providers::ChatRequest;

use super::auth::AuthedUser;
use super::{ApiError, ApiResult};
use crate::bus::EventKind;
use crate::connections::{ConnectionRegistry, TransportKind};
use crate::frames::{Frame, FrameSink};
use crate::scheduler::{WorkItem, WorkKind};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Overrides the configured streaming default.
    #[serde(default)]
    pub stream: Option<bool>,
}

pub async fn chat(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Json(body): Json<ChatBody>,
) -> ApiResult<Response> {
    let message = body.message.trim().to_string();
    if message.is_empty() {
        return Err(Error::InvalidArguments("message is required".into()).into());
    }

    let snapshot = state.config.for_user(&user_id);
    let stream = body.stream.unwrap_or(snapshot.config.api.stream);
    let session = state.sessions.ensure(&user_id, body.session_id.as_deref())?;

    state.bus.emit(
        EventKind::ChannelMessage,
        json!({
            "user_id": user_id,
            "session_id": session.session_id,
            "transport": "http",
            "chars": message.chars().count(),
        }),
    );

    let (tx, rx) = mpsc::channel::<Frame>(256);
    let item = WorkItem {
        user_id: user_id.clone(),
        session_id: session.session_id.clone(),
        kind: WorkKind::Message {
            text: message,
            stream,
        },
        frames: FrameSink::new(tx.clone()),
        attempt: 0,
    };
    state.scheduler.enqueue(item).await?;

    if stream {
        Ok(sse_response(&state, &user_id, &session.session_id, tx, rx))
    } else {
        // Only the work item's sink keeps the channel open from here.
        drop(tx);
        Ok(json_response(&session.session_id, rx).await)
    }
}

/// Stream frames as SSE until the turn reaches `done` or `error`. The
/// connection stays open across a confirmation suspension — resume frames
/// arrive on the same stream.
fn sse_response(
    state: &AppState,
    user_id: &str,
    session_id: &str,
    tx: mpsc::Sender<Frame>,
    mut rx: mpsc::Receiver<Frame>,
) -> Response {
    let connection_id = state.connections.bind_sender(
        user_id,
        Some(session_id),
        TransportKind::HttpSse,
        tx,
    );
    let guard = ConnectionGuard {
        registry: state.connections.clone(),
        connection_id,
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(frame) = rx.recv().await {
            let terminal = matches!(
                frame.get("type").and_then(|t| t.as_str()),
                Some("done") | Some("error")
            );
            yield Ok::<_, Infallible>(Event::default().data(frame.to_string()));
            if terminal {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// Closes the registry binding when the SSE stream ends or the client
/// disconnects. The turn itself keeps running server-side.
struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    connection_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.close(&self.connection_id);
    }
}

/// Non-streaming fallback: drain frames into one JSON object.
async fn json_response(session_id: &str, mut rx: mpsc::Receiver<Frame>) -> Response {
    let mut tool_calls: Vec<Frame> = Vec::new();

    while let Some(frame) = rx.recv().await {
        match frame.get("type").and_then(|t| t.as_str()) {
            Some("done") => {
                return Json(json!({
                    "status": "success",
                    "session_id": session_id,
                    "content": frame.get("content").cloned().unwrap_or_default(),
                    "tool_calls": tool_calls,
                }))
                .into_response();
            }
            Some("error") => {
                return Json(json!({
                    "status": "error",
                    "session_id": session_id,
                    "content": frame.get("content").cloned().unwrap_or_default(),
                }))
                .into_response();
            }
            Some("tool_start") if frame.get("status").and_then(|s| s.as_str())
                == Some("awaiting_confirm") =>
            {
                return Json(json!({
                    "status": "needs_confirmation",
                    "session_id": session_id,
                    "tool_call_id": frame.get("call_id").cloned().unwrap_or_default(),
                    "tool_name": frame.get("tool_name").cloned().unwrap_or_default(),
                    "args": frame.get("args").cloned().unwrap_or_default(),
                }))
                .into_response();
            }
            Some("tool_result") | Some("tool_error") => tool_calls.push(frame),
            _ => {}
        }
    }

    // The channel closed without a terminal frame.
    Json(json!({
        "status": "error",
        "session_id": session_id,
        "content": "the turn ended unexpectedly",
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/chat/confirm
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ConfirmBody {
    pub session_id: String,
    pub tool_call_id: String,
    /// `approve` or `reject`.
    pub action: String,
}

pub async fn confirm(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Json(body): Json<ConfirmBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let approve = match body.action.as_str() {
        "approve" => true,
        "reject" => false,
        other => {
            return Err(Error::InvalidArguments(format!(
                "action must be approve or reject, got `{other}`"
            ))
            .into())
        }
    };

    // Ownership enforced here: a foreign call id is NotFound.
    let pending = state
        .confirm
        .take(&body.tool_call_id, &user_id, &body.session_id)?;
    let frames = pending.suspended.frames.clone();

    let item = WorkItem {
        user_id,
        session_id: body.session_id.clone(),
        kind: WorkKind::Resume {
            pending: Arc::new(parking_lot::Mutex::new(Some(pending))),
            approve,
        },
        frames,
        attempt: 0,
    };
    state.scheduler.resume(item).await?;

    Ok(Json(json!({
        "ok": true,
        "session_id": body.session_id,
        "tool_call_id": body.tool_call_id,
        "status": if approve { "approved" } else { "rejected" },
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/followup
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct FollowupBody {
    pub session_id: String,
    pub selected_text: String,
    /// `why`, `risk`, `alternative`, or `custom`.
    #[serde(default = "default_query_type")]
    pub query_type: String,
    #[serde(default)]
    pub custom_query: Option<String>,
}

fn default_query_type() -> String {
    "why".into()
}

/// One-shot side query about a span of an earlier answer. No turn
/// transaction: nothing durable is written.
pub async fn followup(
    State(state): State<AppState>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Json(body): Json<FollowupBody>,
) -> ApiResult<Json<serde_json::Value>> {
    // Ownership check before touching history.
    state.sessions.get(&user_id, &body.session_id)?;

    let selected: String = body.selected_text.chars().take(400).collect();
    let query = match body.query_type.as_str() {
        "custom" => match body.custom_query.as_deref() {
            Some(q) if !q.trim().is_empty() => {
                format!("{q}\n\nRelated text: {selected}")
            }
            _ => return Err(Error::InvalidArguments("custom_query is required".into()).into()),
        },
        "risk" => format!(
            "What risks or trade-offs are in \"{selected}\"? Keep it under 100 words."
        ),
        "alternative" => format!(
            "Besides \"{selected}\", list 2-3 alternatives and compare briefly in under 100 words."
        ),
        _ => format!(
            "Why did you say \"{selected}\"? Explain the reasoning in under 100 words."
        ),
    };

    let snapshot = state.config.for_user(&user_id);
    let mut messages = vec![ChatMessage::system(snapshot.system_prompt.clone())];
    for (role, content) in state.sessions.recent_history(&user_id, &body.session_id, 3) {
        messages.push(ChatMessage {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
        });
    }
    messages.push(ChatMessage::user(query.clone()));

    let provider = ag_providers::provider_for(&snapshot).map_err(ApiError)?;
    let response = provider
        .chat(&ChatRequest {
            messages,
            tools: Vec::new(),
            temperature: Some(snapshot.config.api.temperature),
            max_tokens: Some(512),
            model: None,
        })
        .await
        .map_err(ApiError)?;

    Ok(Json(json!({
        "query": query,
        "response": response.content,
    })))
}
