//! Live transport connections and outbound frame dispatch.
//!
//! A connection binds a transport (an open SSE response, an IM-bridge
//! socket) to its authenticated user and, optionally, one session. Sends
//! serialize per connection through its own channel. Removal is idempotent;
//! a connection that disappears mid-turn simply stops receiving frames —
//! the turn itself is owned by the scheduler, not the transport.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use crate::bus::{EventBus, EventKind};
use crate::frames::Frame;

const OUTBOUND_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    HttpSse,
    Channel,
}

impl TransportKind {
    fn as_str(&self) -> &'static str {
        match self {
            TransportKind::HttpSse => "http_sse",
            TransportKind::Channel => "channel",
        }
    }
}

struct Binding {
    user_id: String,
    session_id: Option<String>,
    kind: TransportKind,
    tx: mpsc::Sender<Frame>,
}

pub struct ConnectionRegistry {
    bindings: Mutex<HashMap<String, Binding>>,
    bus: EventBus,
}

impl ConnectionRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Bind a new connection; the returned receiver is the transport's
    /// outbound queue.
    pub fn bind(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        kind: TransportKind,
    ) -> (String, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_DEPTH);
        let connection_id = self.bind_sender(user_id, session_id, kind, tx);
        (connection_id, rx)
    }

    /// Bind a connection onto an existing sender (the SSE surface shares
    /// its per-turn frame channel with the registry so broadcasts reach
    /// the same stream).
    pub fn bind_sender(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        kind: TransportKind,
        tx: mpsc::Sender<Frame>,
    ) -> String {
        let connection_id = uuid::Uuid::new_v4().to_string();

        self.bindings.lock().insert(
            connection_id.clone(),
            Binding {
                user_id: user_id.to_string(),
                session_id: session_id.map(str::to_owned),
                kind,
                tx,
            },
        );

        self.bus.emit(
            EventKind::ConnectionBound,
            json!({
                "connection_id": connection_id,
                "user_id": user_id,
                "session_id": session_id,
                "transport": kind.as_str(),
            }),
        );

        connection_id
    }

    /// Queue a frame for one connection. `false` when the connection is
    /// gone or its queue is full.
    pub fn send(&self, connection_id: &str, frame: Frame) -> bool {
        let tx = {
            let bindings = self.bindings.lock();
            match bindings.get(connection_id) {
                Some(binding) => binding.tx.clone(),
                None => return false,
            }
        };
        tx.try_send(frame).is_ok()
    }

    /// Queue a frame for every live connection of a user. Returns how many
    /// accepted it.
    pub fn broadcast(&self, user_id: &str, frame: Frame) -> usize {
        let senders: Vec<mpsc::Sender<Frame>> = {
            let bindings = self.bindings.lock();
            bindings
                .values()
                .filter(|b| b.user_id == user_id)
                .map(|b| b.tx.clone())
                .collect()
        };
        senders
            .into_iter()
            .filter(|tx| tx.try_send(frame.clone()).is_ok())
            .count()
    }

    /// Remove a connection. Idempotent.
    pub fn close(&self, connection_id: &str) {
        let removed = self.bindings.lock().remove(connection_id);
        if let Some(binding) = removed {
            self.bus.emit(
                EventKind::ConnectionClosed,
                json!({
                    "connection_id": connection_id,
                    "user_id": binding.user_id,
                    "session_id": binding.session_id,
                    "transport": binding.kind.as_str(),
                }),
            );
        }
    }

    pub fn count(&self) -> usize {
        self.bindings.lock().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_reaches_only_the_target() {
        let registry = ConnectionRegistry::new(EventBus::new());
        let (id_a, mut rx_a) = registry.bind("u1", None, TransportKind::HttpSse);
        let (_id_b, mut rx_b) = registry.bind("u1", None, TransportKind::HttpSse);

        assert!(registry.send(&id_a, json!({"n": 1})));
        assert_eq!(rx_a.recv().await.unwrap()["n"], 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_is_user_scoped() {
        let registry = ConnectionRegistry::new(EventBus::new());
        let (_a, mut rx_a) = registry.bind("u1", Some("s1"), TransportKind::HttpSse);
        let (_b, mut rx_b) = registry.bind("u1", None, TransportKind::Channel);
        let (_c, mut rx_c) = registry.bind("u2", None, TransportKind::HttpSse);

        let delivered = registry.broadcast("u1", json!({"hello": true}));
        assert_eq!(delivered, 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry = ConnectionRegistry::new(EventBus::new());
        let (id, _rx) = registry.bind("u1", None, TransportKind::HttpSse);

        registry.close(&id);
        registry.close(&id);
        assert_eq!(registry.count(), 0);
        assert!(!registry.send(&id, json!({})));
    }

    #[tokio::test]
    async fn bind_and_close_emit_events() {
        let bus = EventBus::new();
        let mut rx = bus.raw_subscribe();
        let registry = ConnectionRegistry::new(bus);

        let (id, _frames) = registry.bind("u1", None, TransportKind::HttpSse);
        registry.close(&id);

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::ConnectionBound);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::ConnectionClosed);
    }
}
