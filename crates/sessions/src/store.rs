//! Session and message persistence with turn transactions.
//!
//! Committed messages are the only durable state. An open turn is a
//! process-local marker: it enforces "at most one open turn per session"
//! and buffers the user text until commit. In-flight turns are best-effort
//! by design — a crash loses the open turn, never committed history.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use ag_domain::error::{Error, Result};
use ag_domain::message::{Role, StoredMessage, ToolCallRequest};

use crate::persist::{load_json_or_default, write_json_atomic};

const TITLE_MAX_CHARS: usize = 40;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
    #[serde(default)]
    pub next_turn_index: u64,
}

/// Listing shape for `GET /api/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub last_message: String,
}

/// Handle for one open turn. Exactly one of [`SessionStore::commit_turn`] /
/// [`SessionStore::abort_turn`] must consume it.
#[derive(Debug)]
pub struct TurnHandle {
    pub turn_id: String,
    pub user_id: String,
    pub session_id: String,
    pub user_text: String,
}

/// A tool-role message produced during a turn, committed alongside it.
#[derive(Debug, Clone)]
pub struct CommittedToolMessage {
    pub call: ToolCallRequest,
    pub content: String,
}

#[derive(Debug, Clone)]
struct OpenTurn {
    turn_id: String,
    started_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionStore {
    path: PathBuf,
    /// `user_id::session_id` -> record.
    sessions: RwLock<HashMap<String, SessionRecord>>,
    /// Process-local open-turn markers, same keying. Never persisted.
    open: Mutex<HashMap<String, OpenTurn>>,
}

fn key(user_id: &str, session_id: &str) -> String {
    format!("{user_id}::{session_id}")
}

impl SessionStore {
    /// Load or create `sessions.json` under the state directory. Stale open
    /// turns from a previous process are gone by construction.
    pub fn new(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir).map_err(Error::Io)?;
        let path = state_dir.join("sessions.json");
        let sessions: HashMap<String, SessionRecord> = load_json_or_default(&path)?;

        tracing::info!(
            sessions = sessions.len(),
            path = %path.display(),
            "session store loaded"
        );

        Ok(Self {
            path,
            sessions: RwLock::new(sessions),
            open: Mutex::new(HashMap::new()),
        })
    }

    // ── session CRUD ─────────────────────────────────────────────────

    /// Create a session for `user_id`, minting an id when none is given.
    pub fn create(&self, user_id: &str, session_id: Option<&str>) -> Result<SessionRecord> {
        let session_id = session_id
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        let record = SessionRecord {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            title: "New Chat".into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            next_turn_index: 0,
        };

        self.sessions
            .write()
            .insert(key(user_id, &session_id), record.clone());
        self.flush()?;
        Ok(record)
    }

    /// Fetch one session. Absent and foreign-owned are the same `NotFound`.
    pub fn get(&self, user_id: &str, session_id: &str) -> Result<SessionRecord> {
        self.sessions
            .read()
            .get(&key(user_id, session_id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    /// Get the session or create it when this user has none with that id.
    pub fn ensure(&self, user_id: &str, session_id: Option<&str>) -> Result<SessionRecord> {
        match session_id {
            Some(sid) => match self.get(user_id, sid) {
                Ok(record) => Ok(record),
                Err(Error::NotFound(_)) => self.create(user_id, Some(sid)),
                Err(e) => Err(e),
            },
            None => self.create(user_id, None),
        }
    }

    /// Sessions owned by `user_id`, most recently updated first.
    pub fn list(&self, user_id: &str) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| SessionSummary {
                session_id: s.session_id.clone(),
                title: s.title.clone(),
                created_at: s.created_at,
                updated_at: s.updated_at,
                message_count: s.messages.len(),
                last_message: s
                    .messages
                    .last()
                    .map(|m| preview(&m.content, 100))
                    .unwrap_or_default(),
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    pub fn delete(&self, user_id: &str, session_id: &str) -> Result<()> {
        let k = key(user_id, session_id);
        let removed = self.sessions.write().remove(&k).is_some();
        if !removed {
            return Err(Error::NotFound(format!("session {session_id}")));
        }
        self.open.lock().remove(&k);
        self.flush()?;
        Ok(())
    }

    /// Delete every session owned by `user_id` (account removal). Returns
    /// how many were removed.
    pub fn delete_all_for_user(&self, user_id: &str) -> Result<usize> {
        let removed = {
            let mut sessions = self.sessions.write();
            let before = sessions.len();
            sessions.retain(|_, s| s.user_id != user_id);
            before - sessions.len()
        };
        self.open.lock().retain(|k, _| !k.starts_with(&format!("{user_id}::")));
        if removed > 0 {
            self.flush()?;
        }
        Ok(removed)
    }

    // ── turn transaction ─────────────────────────────────────────────

    /// Open a turn. Fails with `Busy` while another turn is open for the
    /// session — at most one open turn per session, system-wide.
    pub fn begin_turn(
        &self,
        user_id: &str,
        session_id: &str,
        user_text: &str,
    ) -> Result<TurnHandle> {
        // Ownership check first; a foreign session is NotFound, not Busy.
        self.get(user_id, session_id)?;

        let k = key(user_id, session_id);
        let mut open = self.open.lock();
        if open.contains_key(&k) {
            return Err(Error::Busy(format!(
                "a turn is already open for session {session_id}"
            )));
        }

        let turn_id = uuid::Uuid::new_v4().to_string();
        open.insert(
            k,
            OpenTurn {
                turn_id: turn_id.clone(),
                started_at: Utc::now(),
            },
        );

        Ok(TurnHandle {
            turn_id,
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            user_text: user_text.to_string(),
        })
    }

    /// Commit a turn: the user message, tool messages, and the assistant
    /// message appear atomically with the next turn index, or not at all.
    pub fn commit_turn(
        &self,
        handle: TurnHandle,
        assistant_text: &str,
        tool_messages: &[CommittedToolMessage],
    ) -> Result<u64> {
        let k = key(&handle.user_id, &handle.session_id);

        {
            let mut open = self.open.lock();
            match open.get(&k) {
                Some(t) if t.turn_id == handle.turn_id => {
                    open.remove(&k);
                }
                _ => {
                    return Err(Error::Internal(format!(
                        "commit for turn {} that is not open",
                        handle.turn_id
                    )))
                }
            }
        }

        let turn_index = {
            let mut sessions = self.sessions.write();
            let record = sessions
                .get_mut(&k)
                .ok_or_else(|| Error::NotFound(format!("session {}", handle.session_id)))?;

            let turn_index = record.next_turn_index;
            record.next_turn_index += 1;
            let now = Utc::now();

            if record.messages.is_empty() {
                record.title = derive_title(&handle.user_text);
            }

            record.messages.push(StoredMessage {
                message_id: uuid::Uuid::new_v4().to_string(),
                role: Role::User,
                content: handle.user_text.clone(),
                tool_calls: Vec::new(),
                created_at: now,
                turn_index,
            });
            for tool in tool_messages {
                record.messages.push(StoredMessage {
                    message_id: uuid::Uuid::new_v4().to_string(),
                    role: Role::Tool,
                    content: tool.content.clone(),
                    tool_calls: vec![tool.call.clone()],
                    created_at: now,
                    turn_index,
                });
            }
            record.messages.push(StoredMessage {
                message_id: uuid::Uuid::new_v4().to_string(),
                role: Role::Assistant,
                content: assistant_text.to_string(),
                tool_calls: Vec::new(),
                created_at: now,
                turn_index,
            });
            record.updated_at = now;
            turn_index
        };

        self.flush()?;
        Ok(turn_index)
    }

    /// Abort a turn: drop the open marker, write nothing.
    pub fn abort_turn(&self, handle: TurnHandle) {
        let k = key(&handle.user_id, &handle.session_id);
        let mut open = self.open.lock();
        if let Some(t) = open.get(&k) {
            if t.turn_id == handle.turn_id {
                open.remove(&k);
            }
        }
    }

    pub fn has_open_turn(&self, user_id: &str, session_id: &str) -> bool {
        self.open.lock().contains_key(&key(user_id, session_id))
    }

    // ── prompt assembly helpers ──────────────────────────────────────

    /// The tail of committed history as (role, content) pairs, bounded by
    /// `history_rounds` user+assistant pairs. Tool messages are not replayed
    /// into prompts.
    pub fn recent_history(
        &self,
        user_id: &str,
        session_id: &str,
        history_rounds: usize,
    ) -> Vec<(Role, String)> {
        let sessions = self.sessions.read();
        let Some(record) = sessions.get(&key(user_id, session_id)) else {
            return Vec::new();
        };
        let max = history_rounds * 2;
        let conversational: Vec<(Role, String)> = record
            .messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .map(|m| (m.role, m.content.clone()))
            .collect();
        let skip = conversational.len().saturating_sub(max);
        conversational.into_iter().skip(skip).collect()
    }

    // ── housekeeping ─────────────────────────────────────────────────

    /// Remove sessions idle longer than `max_age_hours`. `0` disables.
    pub fn cleanup_idle(&self, max_age_hours: u64) -> Result<usize> {
        if max_age_hours == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours as i64);
        let removed = {
            let mut sessions = self.sessions.write();
            let before = sessions.len();
            sessions.retain(|_, s| s.updated_at >= cutoff);
            before - sessions.len()
        };
        if removed > 0 {
            tracing::info!(removed, "idle sessions cleaned up");
            self.flush()?;
        }
        Ok(removed)
    }

    /// Age of the oldest open turn, for diagnostics.
    pub fn oldest_open_turn_age(&self) -> Option<chrono::Duration> {
        let open = self.open.lock();
        open.values()
            .map(|t| Utc::now() - t.started_at)
            .max()
    }

    pub fn flush(&self) -> Result<()> {
        let sessions = self.sessions.read();
        write_json_atomic(&self.path, &*sessions)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn derive_title(text: &str) -> String {
    let one_line: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if one_line.is_empty() {
        return "New Chat".into();
    }
    let truncated: String = one_line.chars().take(TITLE_MAX_CHARS).collect();
    if one_line.chars().count() > TITLE_MAX_CHARS {
        format!("{truncated}...")
    } else {
        truncated
    }
}

fn preview(text: &str, max: usize) -> String {
    let truncated: String = text.chars().take(max).collect();
    if text.chars().count() > max {
        format!("{truncated}...")
    } else {
        truncated
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
