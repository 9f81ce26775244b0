//! `time.now` — the current date and time.

use serde_json::{json, Value};

use ag_domain::error::Result;

use crate::runner::ToolContext;
use crate::Tool;

pub struct TimeNowTool;

#[async_trait::async_trait]
impl Tool for TimeNowTool {
    fn name(&self) -> &str {
        "time.now"
    }

    fn description(&self) -> &str {
        "Current UTC date and time."
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn invoke(&self, _args: Value, _ctx: &ToolContext) -> Result<Value> {
        let now = chrono::Utc::now();
        Ok(json!({
            "iso": now.to_rfc3339(),
            "unix": now.timestamp(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_iso_and_unix() {
        let ctx = ToolContext {
            user_id: "u1".into(),
            session_id: "s1".into(),
            request_id: None,
        };
        let result = TimeNowTool.invoke(Value::Null, &ctx).await.unwrap();
        assert!(result["iso"].as_str().unwrap().contains('T'));
        assert!(result["unix"].as_i64().unwrap() > 0);
    }
}
