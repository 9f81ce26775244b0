//! `web.fetch` — fetch a URL and return the body as text.

use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use ag_domain::error::{Error, Result};

use crate::runner::ToolContext;
use crate::Tool;

const MAX_BODY_CHARS: usize = 200_000;

#[derive(Debug, Deserialize)]
struct FetchArgs {
    url: String,
}

pub struct WebFetchTool {
    http: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web.fetch"
    }

    fn description(&self) -> &str {
        "Fetch an http(s) URL and return the response body as text."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "The http(s) URL to fetch"}
            },
            "required": ["url"]
        })
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let args: FetchArgs = serde_json::from_value(args)
            .map_err(|e| Error::InvalidArguments(format!("web.fetch: {e}")))?;

        if !args.url.starts_with("http://") && !args.url.starts_with("https://") {
            return Err(Error::InvalidArguments(
                "url must start with http:// or https://".into(),
            ));
        }

        let resp = self
            .http
            .get(&args.url)
            .timeout(Duration::from_secs(20))
            .header("User-Agent", "agentgate/0.4")
            .send()
            .await
            .map_err(|e| Error::ToolRuntime {
                message: format!("fetch failed: {e}"),
                retriable: true,
            })?;

        let status = resp.status().as_u16();
        let mut body = resp.text().await.map_err(|e| Error::ToolRuntime {
            message: format!("body read failed: {e}"),
            retriable: true,
        })?;

        if body.chars().count() > MAX_BODY_CHARS {
            body = body.chars().take(MAX_BODY_CHARS).collect();
            body.push_str("\n[truncated]");
        }

        Ok(json!({
            "url": args.url,
            "status": status,
            "body": body,
        }))
    }
}
