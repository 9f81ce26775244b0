//! `shell.exec` — run a shell command and return its output.
//!
//! Ships on the default confirmation list: the turn engine suspends for
//! human approval before this tool runs. Deny patterns are checked first
//! and reject outright, before confirmation is even offered.

use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use ag_domain::config::ExecToolConfig;
use ag_domain::error::{Error, Result};

use crate::runner::ToolContext;
use crate::Tool;

#[derive(Debug, Deserialize)]
struct ExecArgs {
    command: String,
    #[serde(default)]
    workdir: Option<String>,
}

pub struct ShellExecTool {
    cfg: ExecToolConfig,
    denied: Vec<Regex>,
}

impl ShellExecTool {
    pub fn new(cfg: ExecToolConfig) -> Self {
        let denied = cfg
            .denied_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "invalid exec deny pattern ignored");
                    None
                }
            })
            .collect();
        Self { cfg, denied }
    }

    fn check_denied(&self, command: &str) -> Result<()> {
        if let Some(re) = self.denied.iter().find(|re| re.is_match(command)) {
            return Err(Error::ToolDenied(format!(
                "command matches denied pattern `{}`",
                re.as_str()
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Tool for ShellExecTool {
    fn name(&self) -> &str {
        "shell.exec"
    }

    fn description(&self) -> &str {
        "Run a shell command on the host and return stdout/stderr. Requires user approval."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The command to run via sh -c"},
                "workdir": {"type": "string", "description": "Optional working directory"}
            },
            "required": ["command"]
        })
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let args: ExecArgs = serde_json::from_value(args)
            .map_err(|e| Error::InvalidArguments(format!("shell.exec: {e}")))?;
        if args.command.trim().is_empty() {
            return Err(Error::InvalidArguments("command must not be empty".into()));
        }
        self.check_denied(&args.command)?;

        if self.cfg.audit_log {
            tracing::info!(
                user_id = %ctx.user_id,
                session_id = %ctx.session_id,
                command = %args.command,
                "exec audit"
            );
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&args.command);
        if let Some(ref wd) = args.workdir {
            cmd.current_dir(wd);
        }

        let output = cmd.output().await.map_err(|e| Error::ToolRuntime {
            message: format!("failed to spawn: {e}"),
            retriable: false,
        })?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str("\n[stderr]\n");
            text.push_str(&stderr);
        }
        if text.len() > self.cfg.max_output_chars {
            let mut end = self.cfg.max_output_chars;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
            text.push_str("\n[truncated]");
        }

        Ok(json!({
            "exit_code": output.status.code(),
            "output": text,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> ShellExecTool {
        ShellExecTool::new(ExecToolConfig::default())
    }

    fn ctx() -> ToolContext {
        ToolContext {
            user_id: "u1".into(),
            session_id: "s1".into(),
            request_id: None,
        }
    }

    #[tokio::test]
    async fn runs_command_and_captures_output() {
        let result = tool()
            .invoke(json!({"command": "printf hello"}), &ctx())
            .await
            .unwrap();
        assert_eq!(result["exit_code"], 0);
        assert_eq!(result["output"], "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_an_error() {
        let result = tool()
            .invoke(json!({"command": "exit 3"}), &ctx())
            .await
            .unwrap();
        assert_eq!(result["exit_code"], 3);
    }

    #[tokio::test]
    async fn denied_pattern_rejects_before_running() {
        let err = tool()
            .invoke(json!({"command": "rm -rf / --no-preserve-root"}), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool_denied");
    }

    #[tokio::test]
    async fn missing_command_is_invalid_arguments() {
        let err = tool().invoke(json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
    }
}
