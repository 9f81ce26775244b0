//! Outbound frame shapes and the per-turn frame sink.
//!
//! Every frame is one JSON object; the SSE layer writes it as a single
//! `data:` line and flushes. The non-streaming chat path drains the same
//! frames and folds them into one JSON response.

use serde_json::{json, Value};
use tokio::sync::mpsc;

pub type Frame = Value;

pub fn text(content: &str) -> Frame {
    json!({"type": "text", "content": content})
}

pub fn tool_detected(tool_name: &str) -> Frame {
    json!({"type": "tool_detected", "content": format!("tool call detected: {tool_name}")})
}

pub fn tool_start(call_id: &str, tool_name: &str, args: &Value, status: &str) -> Frame {
    json!({
        "type": "tool_start",
        "call_id": call_id,
        "tool_name": tool_name,
        "args": args,
        "status": status,
    })
}

pub fn tool_result(call_id: &str, tool_name: &str, result: &str) -> Frame {
    json!({
        "type": "tool_result",
        "call_id": call_id,
        "tool_name": tool_name,
        "result": result,
    })
}

pub fn tool_error(call_id: &str, content: &str) -> Frame {
    json!({"type": "tool_error", "call_id": call_id, "content": content})
}

/// The final frame of a successful turn; carries the normalized text so
/// non-streaming callers and reconnecting clients can read the reply
/// without replaying the stream.
pub fn done(session_id: &str, content: &str) -> Frame {
    json!({"type": "done", "session_id": session_id, "content": content})
}

pub fn error(content: &str) -> Frame {
    json!({"type": "error", "content": content})
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frame sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Best-effort sender toward the requesting client. A dropped receiver
/// (client went away) turns every send into a no-op — the turn keeps
/// running server-side.
#[derive(Clone, Debug)]
pub struct FrameSink {
    tx: Option<mpsc::Sender<Frame>>,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything (internal channel turns).
    pub fn null() -> Self {
        Self { tx: None }
    }

    pub async fn send(&self, frame: Frame) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(frame).await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.tx.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }
}
