//! The memory service consumed by the gateway.
//!
//! Three operations: write-behind `ingest` of committed turns, gated
//! `recall` during prompt assembly, and the periodic `maintain` pass.
//! Ingest and maintenance failures are logged and swallowed — the turn is
//! independent of memory by contract.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use ag_domain::config::MemoryConfig;
use ag_domain::error::Result;

use crate::extract::extract_facts;
use crate::recall::{self, RecallTier};
use crate::store::{Fact, GraphMemoryStore, GraphView, MaintenanceParams};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One committed turn queued for ingest.
#[derive(Debug, Clone)]
pub struct MemoryCandidate {
    pub session_id: String,
    pub user_id: String,
    pub user_text: String,
    pub assistant_text: String,
    pub timestamp: DateTime<Utc>,
}

/// Notifications the gateway bridges onto its event bus.
#[derive(Debug, Clone)]
pub enum MemoryEvent {
    Saved { user_id: String, facts: usize },
    Recalled { user_id: String, snippets: usize },
    ClusterDone { user_id: String, formed: usize },
    SummaryDone { user_id: String, written: usize },
}

/// One on-demand maintenance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceOp {
    Cluster,
    Summarize,
    Decay,
    Cleanup,
}

impl std::str::FromStr for MaintenanceOp {
    type Err = ag_domain::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cluster" => Ok(MaintenanceOp::Cluster),
            "summarize" => Ok(MaintenanceOp::Summarize),
            "decay" => Ok(MaintenanceOp::Decay),
            "cleanup" => Ok(MaintenanceOp::Cleanup),
            other => Err(ag_domain::Error::InvalidArguments(format!(
                "unknown maintenance op `{other}`"
            ))),
        }
    }
}

/// Totals for one maintenance invocation.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MaintenanceReport {
    pub users: usize,
    pub clustered: usize,
    pub summarized: usize,
    pub decayed: usize,
    pub removed: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ingest queue (bounded, drop-oldest)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct IngestQueue {
    items: Mutex<VecDeque<MemoryCandidate>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl IngestQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push a candidate; at capacity the oldest is dropped and counted.
    fn push(&self, candidate: MemoryCandidate) {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("memory ingest queue full, dropped oldest candidate");
            }
            items.push_back(candidate);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> MemoryCandidate {
        loop {
            if let Some(candidate) = self.items.lock().pop_front() {
                return candidate;
            }
            self.notify.notified().await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MemoryService {
    store: Arc<dyn GraphMemoryStore>,
    cfg: MemoryConfig,
    queue: Arc<IngestQueue>,
    events: mpsc::Sender<MemoryEvent>,
}

impl MemoryService {
    /// Build the service and spawn its ingest worker. The returned receiver
    /// carries [`MemoryEvent`]s for the gateway to re-emit on its bus.
    pub fn new(
        cfg: MemoryConfig,
        store: Arc<dyn GraphMemoryStore>,
    ) -> (Arc<Self>, mpsc::Receiver<MemoryEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let service = Arc::new(Self {
            store,
            queue: Arc::new(IngestQueue::new(cfg.ingest_queue_depth)),
            cfg,
            events: events_tx,
        });

        if service.cfg.enabled {
            let worker = service.clone();
            tokio::spawn(async move {
                loop {
                    let candidate = worker.queue.pop().await;
                    worker.ingest_one(candidate).await;
                }
            });
        }

        (service, events_rx)
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    pub fn ingest_dropped_total(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    // ── ingest ───────────────────────────────────────────────────────

    /// Queue a committed turn for ingest. Non-blocking; never fails the
    /// caller.
    pub fn ingest(&self, candidate: MemoryCandidate) {
        if !self.cfg.enabled {
            return;
        }
        if candidate.user_id.trim().is_empty() {
            tracing::warn!("memory candidate without user_id discarded");
            return;
        }
        self.queue.push(candidate);
    }

    async fn ingest_one(&self, candidate: MemoryCandidate) {
        let facts = extract_facts(&candidate.user_text, &candidate.assistant_text);
        if facts.is_empty() {
            return;
        }

        let mut written = 0usize;
        for (content, entities) in facts {
            let fact = Fact::new(
                &candidate.user_id,
                &candidate.session_id,
                &content,
                entities,
                0.6,
            );
            match self.store.upsert_fact(&candidate.user_id, fact).await {
                Ok(true) => written += 1,
                Ok(false) => {} // near-duplicate, skipped
                Err(e) => {
                    tracing::warn!(
                        user_id = %candidate.user_id,
                        error = %e,
                        "memory ingest failed"
                    );
                    return;
                }
            }
        }

        if written > 0 {
            tracing::debug!(user_id = %candidate.user_id, facts = written, "memory saved");
            let _ = self
                .events
                .try_send(MemoryEvent::Saved {
                    user_id: candidate.user_id,
                    facts: written,
                });
        }
    }

    /// Synchronously drain and ingest everything queued. Test/shutdown
    /// helper.
    pub async fn drain_ingest(&self) {
        loop {
            let next = self.queue.items.lock().pop_front();
            match next {
                Some(candidate) => self.ingest_one(candidate).await,
                None => break,
            }
        }
    }

    // ── recall ───────────────────────────────────────────────────────

    /// Build the recall block for a turn, or `None` when gating skips it,
    /// nothing relevant exists, or the store misses its deadline. Never
    /// returns an error to the turn.
    pub async fn recall(
        &self,
        user_id: &str,
        current_session: &str,
        query_text: &str,
    ) -> Option<String> {
        if !self.cfg.enabled || !self.cfg.recall {
            return None;
        }
        if user_id.trim().is_empty() {
            // Fail closed: no scope, no recall.
            tracing::warn!("recall without user_id refused");
            return None;
        }

        let plan = recall::plan(query_text);
        if plan.tier == RecallTier::Skip {
            return None;
        }

        let query = plan.to_query(query_text, Some(current_session));
        let deadline = Duration::from_millis(self.cfg.recall_timeout_ms);
        let result = tokio::time::timeout(deadline, self.store.search(user_id, &query)).await;

        let snippets = match result {
            Ok(Ok(snippets)) => snippets,
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "memory recall failed");
                return None;
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, "memory recall timed out, skipping");
                return None;
            }
        };

        let block = recall::format_block(&snippets, plan.max_chars)?;
        let _ = self.events.try_send(MemoryEvent::Recalled {
            user_id: user_id.to_string(),
            snippets: snippets.len(),
        });
        Some(block)
    }

    // ── maintenance ──────────────────────────────────────────────────

    /// Run cluster → summarize → decay for one user or for every user with
    /// facts. Idempotent per §store contract; bounded work per pass.
    pub async fn maintain(&self, user_id: Option<&str>) -> Result<MaintenanceReport> {
        if !self.cfg.enabled {
            return Ok(MaintenanceReport::default());
        }

        let users: Vec<String> = match user_id {
            Some(uid) => vec![uid.to_string()],
            None => self.store.user_ids().await?,
        };

        let params = MaintenanceParams::default();
        let mut report = MaintenanceReport {
            users: users.len(),
            ..Default::default()
        };

        for uid in &users {
            match self.store.cluster(uid, &params).await {
                Ok(formed) => {
                    report.clustered += formed;
                    if formed > 0 {
                        let _ = self.events.try_send(MemoryEvent::ClusterDone {
                            user_id: uid.clone(),
                            formed,
                        });
                    }
                }
                Err(e) => tracing::warn!(user_id = %uid, error = %e, "cluster pass failed"),
            }

            match self.store.summarize(uid, &params).await {
                Ok(written) => {
                    report.summarized += written;
                    if written > 0 {
                        let _ = self.events.try_send(MemoryEvent::SummaryDone {
                            user_id: uid.clone(),
                            written,
                        });
                    }
                }
                Err(e) => tracing::warn!(user_id = %uid, error = %e, "summarize pass failed"),
            }

            match self.store.decay(uid, &params).await {
                Ok(outcome) => {
                    report.decayed += outcome.decayed;
                    report.removed += outcome.removed;
                }
                Err(e) => tracing::warn!(user_id = %uid, error = %e, "decay pass failed"),
            }
        }

        Ok(report)
    }

    /// Run a single maintenance pass on demand (the HTTP maintenance
    /// triggers). `Cleanup` is the removal half of decay.
    pub async fn run_op(&self, op: MaintenanceOp, user_id: &str) -> Result<serde_json::Value> {
        if !self.cfg.enabled {
            return Err(ag_domain::Error::UpstreamUnavailable(
                "memory is not enabled".into(),
            ));
        }
        let params = MaintenanceParams::default();
        match op {
            MaintenanceOp::Cluster => {
                let formed = self.store.cluster(user_id, &params).await?;
                if formed > 0 {
                    let _ = self.events.try_send(MemoryEvent::ClusterDone {
                        user_id: user_id.to_string(),
                        formed,
                    });
                }
                Ok(serde_json::json!({"op": "cluster", "formed": formed}))
            }
            MaintenanceOp::Summarize => {
                let written = self.store.summarize(user_id, &params).await?;
                if written > 0 {
                    let _ = self.events.try_send(MemoryEvent::SummaryDone {
                        user_id: user_id.to_string(),
                        written,
                    });
                }
                Ok(serde_json::json!({"op": "summarize", "written": written}))
            }
            MaintenanceOp::Decay | MaintenanceOp::Cleanup => {
                let outcome = self.store.decay(user_id, &params).await?;
                Ok(serde_json::json!({
                    "op": if matches!(op, MaintenanceOp::Decay) { "decay" } else { "cleanup" },
                    "decayed": outcome.decayed,
                    "removed": outcome.removed,
                }))
            }
        }
    }

    // ── pass-throughs ────────────────────────────────────────────────

    pub async fn graph_view(&self, user_id: &str, session_id: &str) -> Result<GraphView> {
        self.store.graph_view(user_id, session_id).await
    }

    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.store.delete_user(user_id).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    pub fn maintain_interval(&self) -> Duration {
        Duration::from_secs(self.cfg.maintain_interval_secs)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
