//! End-to-end memory scoping through the public service API.

use std::sync::Arc;

use ag_domain::config::MemoryConfig;
use ag_memory::{GraphMemoryStore, LocalStore, MemoryCandidate, MemoryService};
use chrono::Utc;

fn service(store: Arc<LocalStore>) -> Arc<MemoryService> {
    let cfg = MemoryConfig {
        enabled: true,
        ..MemoryConfig::default()
    };
    let (service, _events) = MemoryService::new(cfg, store);
    service
}

fn turn(user: &str, session: &str, user_text: &str, assistant_text: &str) -> MemoryCandidate {
    MemoryCandidate {
        session_id: session.into(),
        user_id: user.into(),
        user_text: user_text.into(),
        assistant_text: assistant_text.into(),
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn cross_session_recall_without_cross_user_leak() {
    let store = Arc::new(LocalStore::new());
    let service = service(store.clone());

    // u1 states a fact in session A.
    service.ingest(turn(
        "u1",
        "sA",
        "My name is Wang Er, I am 26.",
        "Nice to meet you, Wang Er.",
    ));
    service.drain_ingest().await;

    // Same user, new session: the fact comes back.
    let block = service
        .recall("u1", "sB", "How old am I?")
        .await
        .expect("u1 should recall their own fact");
    assert!(block.contains("26"));

    // A different user asking the same question gets nothing that exists
    // only under u1.
    let leaked = service.recall("u2", "sC", "How old am I?").await;
    assert!(leaked.is_none(), "u2 must not see u1's facts");
}

#[tokio::test]
async fn dedup_skips_repeated_turns() {
    let store = Arc::new(LocalStore::new());
    let service = service(store.clone());

    for _ in 0..3 {
        service.ingest(turn("u1", "sA", "I live in Hangzhou.", "Noted."));
    }
    service.drain_ingest().await;

    assert_eq!(store.fact_count("u1"), 1);
}

#[tokio::test]
async fn user_deletion_removes_every_fact() {
    let store = Arc::new(LocalStore::new());
    let service = service(store.clone());

    service.ingest(turn("u1", "sA", "I work at Acme Corp.", "Noted."));
    service.ingest(turn("u2", "sB", "I work at Globex.", "Noted."));
    service.drain_ingest().await;

    service.delete_user("u1").await.unwrap();
    assert_eq!(store.fact_count("u1"), 0);
    assert!(store.fact_count("u2") > 0);

    let ids = store.user_ids().await.unwrap();
    assert!(!ids.contains(&"u1".to_string()));
}
