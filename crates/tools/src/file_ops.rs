//! `fs.read` — read a text file from the host filesystem.

use serde::Deserialize;
use serde_json::{json, Value};

use ag_domain::error::{Error, Result};

use crate::runner::ToolContext;
use crate::Tool;

const MAX_BYTES: u64 = 512 * 1024;

#[derive(Debug, Deserialize)]
struct ReadArgs {
    path: String,
    /// 1-based line to start at.
    #[serde(default)]
    offset: Option<usize>,
    /// Max lines returned.
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Default)]
pub struct FileReadTool;

#[async_trait::async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "fs.read"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file, optionally a line range."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Absolute or relative file path"},
                "offset": {"type": "integer", "description": "1-based first line"},
                "limit": {"type": "integer", "description": "Max lines to return"}
            },
            "required": ["path"]
        })
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let args: ReadArgs = serde_json::from_value(args)
            .map_err(|e| Error::InvalidArguments(format!("fs.read: {e}")))?;

        let metadata = tokio::fs::metadata(&args.path)
            .await
            .map_err(|e| Error::ToolRuntime {
                message: format!("{}: {e}", args.path),
                retriable: false,
            })?;
        if metadata.is_dir() {
            return Err(Error::InvalidArguments(format!(
                "{} is a directory",
                args.path
            )));
        }
        if metadata.len() > MAX_BYTES {
            return Err(Error::InvalidArguments(format!(
                "{} is larger than {MAX_BYTES} bytes",
                args.path
            )));
        }

        let content = tokio::fs::read_to_string(&args.path)
            .await
            .map_err(|e| Error::ToolRuntime {
                message: format!("{}: {e}", args.path),
                retriable: false,
            })?;

        let offset = args.offset.unwrap_or(1).max(1) - 1;
        let limit = args.limit.unwrap_or(usize::MAX);
        let lines: Vec<&str> = content.lines().skip(offset).take(limit).collect();

        Ok(json!({
            "path": args.path,
            "content": lines.join("\n"),
            "total_lines": content.lines().count(),
        }))
    }
}
