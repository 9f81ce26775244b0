//! `ag-tools` — tool registry and built-in tools.
//!
//! Tools are in-tree implementations of the [`Tool`] trait, discovered by a
//! compile-time registry — no dynamic loading. The runner resolves a name,
//! checks the allow-list from the caller's config snapshot, enforces a
//! per-tool timeout, and returns a structured [`ToolEnvelope`]; it never
//! panics a turn over a misbehaving tool.
//!
//! Tools treat their arguments as untrusted input.

pub mod clock;
pub mod exec;
pub mod file_ops;
mod runner;
pub mod web_fetch;

pub use runner::{ToolContext, ToolEnvelope, ToolErrorInfo, ToolPolicy, ToolRunner};

use ag_domain::error::Result;
use serde_json::Value;

/// One capability the model may invoke.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Registry name, e.g. `shell.exec`.
    fn name(&self) -> &str;

    /// One-line description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters(&self) -> Value;

    /// Execute. Argument validation is the tool's own job — the runner only
    /// guarantees `args` is a JSON value.
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Definition list for a prompt, filtered by the caller's allow-list.
pub fn definitions_for(
    runner: &ToolRunner,
    policy: &ToolPolicy,
) -> Vec<ag_domain::message::ToolDefinition> {
    runner
        .tools()
        .filter(|tool| policy.is_allowed(tool.name()))
        .map(|tool| ag_domain::message::ToolDefinition {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters(),
        })
        .collect()
}
