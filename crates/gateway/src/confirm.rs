//! Pending tool confirmations and suspended turn state.
//!
//! When a policy-gated tool call is detected, the turn engine does not park
//! a live task across user think-time. It serializes the partial turn —
//! prompt prefix, accumulated text, tool results so far, the remaining
//! call queue — into a [`SuspendedTurn`], stores it here keyed by
//! `call_id`, and releases its worker. `POST /api/chat/confirm` (or TTL
//! expiry, which behaves as reject) turns the value back into a resume
//! work item for the scheduler.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use ag_domain::config::ConfigSnapshot;
use ag_domain::error::{Error, Result};
use ag_domain::message::{ChatMessage, ToolCallRequest};
use ag_sessions::store::CommittedToolMessage;
use ag_sessions::TurnHandle;

use crate::frames::FrameSink;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Suspended state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything needed to resume a turn after the user decides. The open
/// turn handle travels with it — the turn transaction stays open while the
/// user thinks.
#[derive(Debug)]
pub struct SuspendedTurn {
    pub turn: TurnHandle,
    pub snapshot: Arc<ConfigSnapshot>,
    /// Prompt prefix, including the assistant message that requested the
    /// pending calls.
    pub messages: Vec<ChatMessage>,
    /// Assistant text accumulated across earlier hops.
    pub answer: String,
    /// Tool results already produced this turn.
    pub tool_messages: Vec<CommittedToolMessage>,
    /// The pending call is at the front; later calls of the same hop
    /// follow.
    pub pending_calls: VecDeque<ToolCallRequest>,
    pub hops_used: u32,
    /// The original request's frame channel, so resume output reaches the
    /// still-open stream.
    pub frames: FrameSink,
    pub stream: bool,
}

#[derive(Debug)]
pub struct PendingConfirmation {
    pub call_id: String,
    pub user_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub created_at: Instant,
    pub suspended: SuspendedTurn,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ConfirmStore {
    pending: Mutex<HashMap<String, PendingConfirmation>>,
    ttl: Duration,
}

impl ConfirmStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, confirmation: PendingConfirmation) {
        self.pending
            .lock()
            .insert(confirmation.call_id.clone(), confirmation);
    }

    /// Claim a pending confirmation. Ownership is enforced here: a call id
    /// that exists under another user or session is `NotFound`, same as one
    /// that never existed.
    pub fn take(
        &self,
        call_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<PendingConfirmation> {
        let mut pending = self.pending.lock();
        match pending.remove(call_id) {
            Some(p) if p.user_id == user_id && p.session_id == session_id => Ok(p),
            Some(p) => {
                // Wrong owner: put it back, answer as if it never existed.
                pending.insert(call_id.to_string(), p);
                Err(Error::NotFound(format!("pending tool call {call_id}")))
            }
            None => Err(Error::NotFound(format!("pending tool call {call_id}"))),
        }
    }

    /// Remove and return every confirmation past its TTL.
    pub fn take_expired(&self) -> Vec<PendingConfirmation> {
        let mut pending = self.pending.lock();
        let expired_ids: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.created_at.elapsed() >= self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| pending.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
