//! The backing-store contract and its data shapes.

use ag_domain::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Facts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which tier of the memory hierarchy a fact lives in. Maintenance promotes
/// facts upward: raw `Hot` facts cluster into `Warm` concepts, which
/// summarize into `Cold` summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLayer {
    Hot,
    Warm,
    Cold,
}

/// One stored unit of memory, scoped to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub fact_id: String,
    pub user_id: String,
    pub session_id: String,
    pub content: String,
    pub entities: Vec<String>,
    pub importance: f32,
    pub layer: MemoryLayer,
    pub created_at: DateTime<Utc>,
    /// SHA-256 of the normalized content, used for ingest dedup.
    pub content_hash: String,
    /// Set by `cluster` so a second pass over the same data is a no-op.
    #[serde(default)]
    pub clustered: bool,
    /// Last day decay was applied; keeps `decay` idempotent within a day.
    #[serde(default)]
    pub last_decay: Option<DateTime<Utc>>,
}

impl Fact {
    pub fn new(
        user_id: &str,
        session_id: &str,
        content: &str,
        entities: Vec<String>,
        importance: f32,
    ) -> Self {
        Self {
            fact_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            content: content.to_string(),
            entities,
            importance,
            layer: MemoryLayer::Hot,
            created_at: Utc::now(),
            content_hash: content_hash(content),
            clustered: false,
            last_decay: None,
        }
    }
}

/// Normalize whitespace + case, then hash. Near-identical phrasings of the
/// same sentence dedup to the same key.
pub fn content_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let normalized: String = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The recall layer a snippet came from, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecallLayer {
    Summary,
    Concept,
    Direct,
    Related,
    Recent,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snippet {
    pub content: String,
    pub layer: RecallLayer,
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    pub session_id: String,
    /// For `Related` hits: the entity that linked the snippet in.
    pub via: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub entities: Vec<String>,
    /// Max snippets per recall layer.
    pub per_layer: usize,
    /// The session asking; its own facts are excluded (recall is
    /// cross-session by definition).
    pub exclude_session: Option<String>,
    /// Window for the `Recent` layer.
    pub recent_days: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Maintenance
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct MaintenanceParams {
    /// Upper bound of items touched per invocation; keeps each pass cheap.
    pub max_items: usize,
}

impl Default for MaintenanceParams {
    fn default() -> Self {
        Self { max_items: 200 }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DecayOutcome {
    pub decayed: usize,
    pub removed: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Graph view
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub content: String,
    pub layer: String,
    pub importance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub edge_type: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphView {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The store contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The five operations the core depends on, plus a graph view for the UI
/// and user deletion for account removal. Any implementation satisfying
/// these contracts can be substituted.
///
/// Isolation invariant: every method takes `user_id` and must filter by it.
/// Implementations reject an empty `user_id` rather than querying without
/// one — the scope check fails closed.
#[async_trait::async_trait]
pub trait GraphMemoryStore: Send + Sync {
    /// Insert a fact unless a near-duplicate already exists (same content
    /// hash for the user). Returns `true` when the fact was written.
    async fn upsert_fact(&self, user_id: &str, fact: Fact) -> Result<bool>;

    /// Layered cross-session search scoped to `user_id`.
    async fn search(&self, user_id: &str, query: &SearchQuery) -> Result<Vec<Snippet>>;

    /// Cluster hot facts that share entities into warm concepts. Returns
    /// how many concepts were formed. Idempotent: already-clustered facts
    /// are skipped.
    async fn cluster(&self, user_id: &str, params: &MaintenanceParams) -> Result<usize>;

    /// Fold aged warm concepts into cold summaries. Returns how many
    /// summaries were written.
    async fn summarize(&self, user_id: &str, params: &MaintenanceParams) -> Result<usize>;

    /// Apply time decay to importance and drop forgotten facts. At most one
    /// decay step per fact per day, so back-to-back invocations are
    /// observationally equivalent to one.
    async fn decay(&self, user_id: &str, params: &MaintenanceParams) -> Result<DecayOutcome>;

    /// Nodes and edges of one session's memory subgraph, ownership
    /// enforced.
    async fn graph_view(&self, user_id: &str, session_id: &str) -> Result<GraphView>;

    /// Remove every fact belonging to `user_id`.
    async fn delete_user(&self, user_id: &str) -> Result<()>;

    /// Users that currently have facts (drives the maintenance tick).
    async fn user_ids(&self) -> Result<Vec<String>>;

    /// Cheap reachability probe for the doctor surface.
    async fn ping(&self) -> Result<()>;
}

/// Shared fail-closed guard: used by every implementation before touching
/// storage.
pub fn require_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(Error::InvalidArguments(
            "memory operations require a user_id".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_normalizes_whitespace_and_case() {
        assert_eq!(
            content_hash("My name  is Wang Er."),
            content_hash("my name is wang er.")
        );
        assert_ne!(content_hash("I am 26."), content_hash("I am 27."));
    }

    #[test]
    fn empty_user_id_fails_closed() {
        assert!(require_user_id("").is_err());
        assert!(require_user_id("  ").is_err());
        assert!(require_user_id("u1").is_ok());
    }
}
