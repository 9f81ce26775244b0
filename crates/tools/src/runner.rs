//! Name resolution, policy gating, timeout enforcement, result envelopes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use ag_domain::config::ConfigSnapshot;
use ag_domain::error::Error;

use crate::Tool;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context & policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Who is invoking, threaded into every tool call for logging and scoping.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub user_id: String,
    pub session_id: String,
    pub request_id: Option<String>,
}

/// The effective tool policy for one turn, derived from its config
/// snapshot.
#[derive(Debug, Clone)]
pub struct ToolPolicy {
    /// Empty set = everything registered is allowed.
    allow: BTreeSet<String>,
    confirm: BTreeSet<String>,
    default_timeout: Duration,
    timeout_overrides: HashMap<String, Duration>,
}

impl ToolPolicy {
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Self {
        let tools = &snapshot.config.tools;
        Self {
            allow: tools.allow.iter().cloned().collect(),
            confirm: tools.confirm_required.iter().cloned().collect(),
            default_timeout: Duration::from_millis(tools.timeout_ms),
            timeout_overrides: tools
                .timeout_overrides_ms
                .iter()
                .map(|(name, ms)| (name.clone(), Duration::from_millis(*ms)))
                .collect(),
        }
    }

    pub fn is_allowed(&self, tool_name: &str) -> bool {
        self.allow.is_empty() || self.allow.contains(tool_name)
    }

    /// Does this tool require human confirmation before executing?
    pub fn needs_confirmation(&self, tool_name: &str) -> bool {
        self.confirm.contains(tool_name)
    }

    pub fn timeout_for(&self, tool_name: &str) -> Duration {
        self.timeout_overrides
            .get(tool_name)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct ToolErrorInfo {
    /// `not_found` / `denied` / `timeout` / `invalid_arguments` / `runtime`.
    pub category: &'static str,
    pub message: String,
}

/// What every invocation returns, success or not.
#[derive(Debug, Clone, Serialize)]
pub struct ToolEnvelope {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorInfo>,
}

impl ToolEnvelope {
    fn ok(value: Value) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    fn err(category: &'static str, message: String) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(ToolErrorInfo { category, message }),
        }
    }

    /// Render for a tool-role message in the prompt.
    pub fn as_prompt_text(&self) -> String {
        match (&self.value, &self.error) {
            (Some(value), _) => match value.as_str() {
                Some(s) => s.to_string(),
                None => value.to_string(),
            },
            (None, Some(err)) => format!("tool error ({}): {}", err.category, err.message),
            (None, None) => String::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The compile-time tool registry plus invocation plumbing.
pub struct ToolRunner {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRunner {
    /// Registry with every built-in tool.
    pub fn builtin(exec_cfg: ag_domain::config::ExecToolConfig) -> Self {
        let mut runner = Self {
            tools: HashMap::new(),
        };
        runner.register(Arc::new(crate::exec::ShellExecTool::new(exec_cfg)));
        runner.register(Arc::new(crate::file_ops::FileReadTool::default()));
        runner.register(Arc::new(crate::web_fetch::WebFetchTool::new()));
        runner.register(Arc::new(crate::clock::TimeNowTool));
        runner
    }

    /// Empty registry, for tests that bring their own tools.
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn tools(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.values()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Resolve, gate, execute with a deadline, and wrap the outcome. This
    /// is infallible by design — every failure mode is an envelope, and the
    /// caller decides how to surface it.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
        policy: &ToolPolicy,
    ) -> ToolEnvelope {
        let Some(tool) = self.tools.get(name) else {
            return ToolEnvelope::err("not_found", format!("no tool named `{name}`"));
        };

        if !policy.is_allowed(name) {
            return ToolEnvelope::err("denied", format!("tool `{name}` is not on the allow-list"));
        }

        let deadline = policy.timeout_for(name);
        let started = std::time::Instant::now();
        tracing::debug!(
            tool = name,
            user_id = %ctx.user_id,
            session_id = %ctx.session_id,
            "tool invocation start"
        );

        let outcome = tokio::time::timeout(deadline, tool.invoke(args, ctx)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let envelope = match outcome {
            Ok(Ok(value)) => ToolEnvelope::ok(value),
            Ok(Err(Error::InvalidArguments(msg))) => ToolEnvelope::err("invalid_arguments", msg),
            Ok(Err(Error::ToolDenied(msg))) => ToolEnvelope::err("denied", msg),
            Ok(Err(e)) => ToolEnvelope::err("runtime", e.to_string()),
            Err(_) => ToolEnvelope::err(
                "timeout",
                format!("tool `{name}` exceeded {}ms", deadline.as_millis()),
            ),
        };

        if envelope.ok {
            tracing::debug!(tool = name, elapsed_ms, "tool invocation done");
        } else {
            let category = envelope.error.as_ref().map(|e| e.category).unwrap_or("?");
            tracing::warn!(
                tool = name,
                elapsed_ms,
                category,
                user_id = %ctx.user_id,
                session_id = %ctx.session_id,
                "tool invocation failed"
            );
        }
        envelope
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
