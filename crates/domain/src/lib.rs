//! `ag-domain` — shared types for the agentgate workspace.
//!
//! Everything the other crates agree on lives here: the configuration tree
//! (with layered merge + environment overlay), the error taxonomy, chat
//! message shapes, and provider-agnostic stream events.

pub mod config;
pub mod error;
pub mod message;
pub mod stream;

pub use error::{Error, Result};
