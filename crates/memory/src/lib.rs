//! `ag-memory` — graph-shaped long-term memory.
//!
//! The core talks to any backing store through the five-operation
//! [`GraphMemoryStore`] contract (`upsert_fact`, `search`, `cluster`,
//! `summarize`, `decay`) plus a graph view for the UI. Two implementations
//! ship: [`Neo4jStore`] over the Neo4j HTTP transaction API, and
//! [`LocalStore`], an in-process store used when Neo4j is disabled and in
//! tests.
//!
//! [`MemoryService`] is what the gateway consumes: write-behind ingest of
//! committed turns (never blocking a turn), gated cross-session recall, and
//! the periodic cluster → summarize → decay maintenance pass. Every
//! operation is scoped by `user_id` and fails closed without one.

pub mod extract;
pub mod local;
pub mod neo4j;
pub mod recall;
pub mod service;
pub mod store;

pub use local::LocalStore;
pub use neo4j::Neo4jStore;
pub use service::{MaintenanceOp, MaintenanceReport, MemoryCandidate, MemoryEvent, MemoryService};
pub use store::{
    DecayOutcome, Fact, GraphMemoryStore, GraphView, MaintenanceParams, MemoryLayer, RecallLayer,
    SearchQuery, Snippet,
};
