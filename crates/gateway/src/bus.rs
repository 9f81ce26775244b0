//! Typed publish/subscribe event bus.
//!
//! Fan-out runs over a `tokio::sync::broadcast` channel: per-subscriber
//! delivery preserves emission order, and a lagging subscriber loses its
//! **oldest** pending events (the channel overwrites from the tail), which
//! is exactly the bounded-mailbox overflow contract. Dropped counts are
//! surfaced to the doctor endpoint. Handler failures are logged and
//! isolated — they never reach sibling subscribers or the emitter, and
//! `emit` returns once the event is scheduled, not handled.
//!
//! There is no persistence. Events lost on crash are lost.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

/// Per-subscriber mailbox bound.
const MAILBOX_CAPACITY: usize = 256;
/// Events kept for the doctor surface.
const HISTORY_CAPACITY: usize = 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event kinds (closed set)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChannelMessage,
    ConversationStart,
    StreamText,
    StreamToolDetected,
    StreamToolStart,
    StreamToolResult,
    StreamToolError,
    ConversationComplete,
    ConversationError,
    ToolCallStart,
    ToolCallResult,
    ToolCallError,
    MemorySaved,
    MemoryRecalled,
    MemoryClusterDone,
    MemorySummaryDone,
    ConfigChanged,
    ConnectionBound,
    ConnectionClosed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ChannelMessage => "channel.message",
            EventKind::ConversationStart => "conversation.start",
            EventKind::StreamText => "conversation.stream.text",
            EventKind::StreamToolDetected => "conversation.stream.tool_detected",
            EventKind::StreamToolStart => "conversation.stream.tool_start",
            EventKind::StreamToolResult => "conversation.stream.tool_result",
            EventKind::StreamToolError => "conversation.stream.tool_error",
            EventKind::ConversationComplete => "conversation.complete",
            EventKind::ConversationError => "conversation.error",
            EventKind::ToolCallStart => "tool.call.start",
            EventKind::ToolCallResult => "tool.call.result",
            EventKind::ToolCallError => "tool.call.error",
            EventKind::MemorySaved => "memory.saved",
            EventKind::MemoryRecalled => "memory.recalled",
            EventKind::MemoryClusterDone => "memory.cluster.done",
            EventKind::MemorySummaryDone => "memory.summary.done",
            EventKind::ConfigChanged => "config.changed",
            EventKind::ConnectionBound => "connection.bound",
            EventKind::ConnectionClosed => "connection.closed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "type": self.kind.as_str(),
            "payload": self.payload,
            "timestamp": self.timestamp.to_rfc3339(),
            "correlation_id": self.correlation_id,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    dropped: Arc<AtomicU64>,
    emitted: Arc<AtomicU64>,
    history: Arc<Mutex<VecDeque<Event>>>,
    counts: Arc<Mutex<HashMap<&'static str, u64>>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BusStats {
    pub emitted_total: u64,
    pub dropped_total: u64,
    pub subscribers: usize,
    pub history_len: usize,
    pub counts: HashMap<&'static str, u64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MAILBOX_CAPACITY);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            emitted: Arc::new(AtomicU64::new(0)),
            history: Arc::new(Mutex::new(VecDeque::new())),
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish an event. Returns after the event is scheduled for every
    /// current subscriber; it does not wait for handlers.
    pub fn emit(&self, kind: EventKind, payload: Value) {
        self.emit_with(kind, payload, None);
    }

    pub fn emit_with(&self, kind: EventKind, payload: Value, correlation_id: Option<String>) {
        let event = Event {
            kind,
            payload,
            timestamp: Utc::now(),
            correlation_id,
        };

        self.emitted.fetch_add(1, Ordering::Relaxed);
        *self.counts.lock().entry(kind.as_str()).or_insert(0) += 1;

        {
            let mut history = self.history.lock();
            if history.len() >= HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // A send error just means no subscriber is listening right now.
        let _ = self.tx.send(event);
    }

    /// Register an async handler for a set of kinds (empty = all). The
    /// handler runs on its own task; an `Err` is logged with the subscriber
    /// name and otherwise ignored.
    pub fn subscribe<F, Fut>(&self, name: &'static str, kinds: &[EventKind], handler: F)
    where
        F: Fn(Event) -> Fut + Send + 'static,
        Fut: Future<Output = ag_domain::Result<()>> + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let kinds: Vec<EventKind> = kinds.to_vec();
        let dropped = self.dropped.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if !kinds.is_empty() && !kinds.contains(&event.kind) {
                            continue;
                        }
                        if let Err(e) = handler(event).await {
                            tracing::warn!(subscriber = name, error = %e, "event handler failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        dropped.fetch_add(n, Ordering::Relaxed);
                        tracing::warn!(subscriber = name, lost = n, "subscriber mailbox overflow");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// A raw receiver for callers that drive their own loop (tests, SSE
    /// taps). Same mailbox semantics.
    pub fn raw_subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            emitted_total: self.emitted.load(Ordering::Relaxed),
            dropped_total: self.dropped.load(Ordering::Relaxed),
            subscribers: self.tx.receiver_count(),
            history_len: self.history.lock().len(),
            counts: self.counts.lock().clone(),
        }
    }

    /// The most recent events, newest last.
    pub fn history(&self, limit: usize) -> Vec<Event> {
        let history = self.history.lock();
        history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn delivery_preserves_emission_order() {
        let bus = EventBus::new();
        let mut rx = bus.raw_subscribe();

        for i in 0..10 {
            bus.emit(EventKind::StreamText, json!({"seq": i}));
        }

        for i in 0..10 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.payload["seq"], i);
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_siblings() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        bus.subscribe("always-fails", &[], |_| async {
            Err(ag_domain::Error::Internal("boom".into()))
        });
        bus.subscribe("observer", &[], move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.kind);
                Ok(())
            }
        });

        // Give the subscriber tasks a beat to register.
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.emit(EventKind::ConversationStart, json!({}));
        bus.emit(EventKind::ConversationComplete, json!({}));

        assert_eq!(rx.recv().await, Some(EventKind::ConversationStart));
        assert_eq!(rx.recv().await, Some(EventKind::ConversationComplete));
    }

    #[tokio::test]
    async fn kind_filter_applies() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        bus.subscribe("tool-only", &[EventKind::ToolCallResult], move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.kind);
                Ok(())
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.emit(EventKind::StreamText, json!({}));
        bus.emit(EventKind::ToolCallResult, json!({}));

        assert_eq!(rx.recv().await, Some(EventKind::ToolCallResult));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::new();
        let mut rx = bus.raw_subscribe();

        // Overrun the mailbox without draining it.
        for i in 0..(MAILBOX_CAPACITY + 50) {
            bus.emit(EventKind::StreamText, json!({"seq": i}));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                assert!(n >= 50 as u64);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        // The next delivered event is a later one (oldest were dropped),
        // and order is still a prefix-preserving subsequence.
        let event = rx.recv().await.unwrap();
        assert!(event.payload["seq"].as_u64().unwrap() >= 50);
    }

    #[tokio::test]
    async fn history_is_bounded_and_counted() {
        let bus = EventBus::new();
        for _ in 0..(HISTORY_CAPACITY + 10) {
            bus.emit(EventKind::StreamText, json!({}));
        }
        let stats = bus.stats();
        assert_eq!(stats.history_len, HISTORY_CAPACITY);
        assert_eq!(stats.emitted_total, (HISTORY_CAPACITY + 10) as u64);
        assert_eq!(
            stats.counts["conversation.stream.text"],
            (HISTORY_CAPACITY + 10) as u64
        );
    }
}
