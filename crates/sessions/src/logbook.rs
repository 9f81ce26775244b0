//! Per-user daily conversation logs.
//!
//! One UTF-8 file per user per day under `logs/<user_id>/YYYY-MM-DD.log`,
//! appended after each committed turn. These are operator-facing records,
//! separate from structured tracing output.

use std::io::Write;
use std::path::PathBuf;

use ag_domain::error::{Error, Result};
use chrono::Utc;

pub struct DailyLogWriter {
    root: PathBuf,
}

impl DailyLogWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Append one committed turn. Failures here are the caller's to log and
    /// swallow — a lost log line must never fail a turn.
    pub fn append_turn(
        &self,
        user_id: &str,
        model: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<()> {
        let dir = self.root.join(safe_user_segment(user_id));
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;

        let now = Utc::now();
        let path = dir.join(format!("{}.log", now.format("%Y-%m-%d")));
        let time = now.format("%H:%M:%S");

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(Error::Io)?;
        writeln!(file, "[{time}] USER: {user_text}").map_err(Error::Io)?;
        writeln!(file, "[{time}] ASSISTANT ({model}): {assistant_text}").map_err(Error::Io)?;
        writeln!(file, "{}", "-".repeat(50)).map_err(Error::Io)?;
        Ok(())
    }
}

/// Keep user ids filesystem-safe: alphanumerics, `-`, `_`, `.`; everything
/// else becomes `_`. Capped at 128 chars.
fn safe_user_segment(user_id: &str) -> String {
    let cleaned: String = user_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(128)
        .collect();
    if cleaned.is_empty() {
        "unknown".into()
    } else {
        cleaned
    }
}
