//! User accounts and bearer tokens.
//!
//! Passwords are stored as `salt$digest` where `digest = sha256(salt ||
//! password)`; verification compares in constant time. Tokens are opaque
//! random strings handed to the client once — only their SHA-256 digest is
//! kept, so a leaked state file does not leak live credentials.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use ag_domain::error::{Error, Result};

use crate::persist::{load_json_or_default, write_json_atomic};

const TOKEN_LEN: usize = 48;
const SALT_LEN: usize = 16;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub username: String,
    pub password_hash: String,
    pub agent_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    user_id: String,
    issued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsersFile {
    /// user_id -> account
    users: HashMap<String, UserRecord>,
    /// sha256(token) hex -> token record
    tokens: HashMap<String, TokenRecord>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct UserStore {
    path: PathBuf,
    inner: RwLock<UsersFile>,
    token_ttl_days: u32,
}

impl UserStore {
    /// Load or create `users.json` under the state directory.
    pub fn new(state_dir: &Path, token_ttl_days: u32) -> Result<Self> {
        std::fs::create_dir_all(state_dir).map_err(Error::Io)?;
        let path = state_dir.join("users.json");
        let file: UsersFile = load_json_or_default(&path)?;

        tracing::info!(
            users = file.users.len(),
            path = %path.display(),
            "user store loaded"
        );

        Ok(Self {
            path,
            inner: RwLock::new(file),
            token_ttl_days,
        })
    }

    // ── accounts ─────────────────────────────────────────────────────

    /// Create an account and issue a first token. Usernames are unique.
    pub fn register(
        &self,
        username: &str,
        password: &str,
        agent_name: Option<&str>,
    ) -> Result<(UserRecord, String)> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(Error::InvalidArguments(
                "username and password are required".into(),
            ));
        }

        let record = {
            let mut file = self.inner.write();
            if file.users.values().any(|u| u.username == username) {
                return Err(Error::InvalidArguments(format!(
                    "username `{username}` is already taken"
                )));
            }

            let record = UserRecord {
                user_id: uuid::Uuid::new_v4().to_string(),
                username: username.to_string(),
                password_hash: hash_password(password),
                agent_name: agent_name.unwrap_or("").trim().to_string(),
                created_at: Utc::now(),
            };
            file.users.insert(record.user_id.clone(), record.clone());
            record
        };
        self.flush()?;

        let token = self.issue_token(&record.user_id)?;
        tracing::info!(user_id = %record.user_id, username = %record.username, "user registered");
        Ok((record, token))
    }

    /// Verify credentials and issue a fresh token.
    pub fn login(&self, username: &str, password: &str) -> Result<(UserRecord, String)> {
        let record = {
            let file = self.inner.read();
            file.users
                .values()
                .find(|u| u.username == username.trim())
                .cloned()
        };

        let record = record.ok_or_else(|| {
            Error::Unauthorized("invalid username or password".into())
        })?;

        if !verify_password(password, &record.password_hash) {
            return Err(Error::Unauthorized("invalid username or password".into()));
        }

        let token = self.issue_token(&record.user_id)?;
        Ok((record, token))
    }

    pub fn get(&self, user_id: &str) -> Option<UserRecord> {
        self.inner.read().users.get(user_id).cloned()
    }

    /// Remove an account and revoke all its tokens. Explicit admin action
    /// only; sessions are removed by the caller.
    pub fn delete_user(&self, user_id: &str) -> Result<()> {
        {
            let mut file = self.inner.write();
            if file.users.remove(user_id).is_none() {
                return Err(Error::NotFound(format!("user {user_id}")));
            }
            file.tokens.retain(|_, t| t.user_id != user_id);
        }
        self.flush()?;
        tracing::info!(user_id = %user_id, "user deleted");
        Ok(())
    }

    // ── tokens ───────────────────────────────────────────────────────

    /// Resolve a bearer token to a `user_id`. Expired tokens resolve to
    /// nothing and are removed lazily.
    pub fn resolve_token(&self, token: &str) -> Option<String> {
        let digest = digest_hex(token);
        let mut expired = false;

        let resolved = {
            let file = self.inner.read();
            file.tokens.get(&digest).and_then(|t| {
                if t.expires_at.map(|exp| exp < Utc::now()).unwrap_or(false) {
                    expired = true;
                    None
                } else {
                    Some(t.user_id.clone())
                }
            })
        };

        if expired {
            self.inner.write().tokens.remove(&digest);
            let _ = self.flush();
        }
        resolved
    }

    /// Invalidate one token (logout). Idempotent.
    pub fn revoke_token(&self, token: &str) {
        let removed = self.inner.write().tokens.remove(&digest_hex(token)).is_some();
        if removed {
            let _ = self.flush();
        }
    }

    fn issue_token(&self, user_id: &str) -> Result<String> {
        let token = mint_token();
        let expires_at = if self.token_ttl_days > 0 {
            Some(Utc::now() + Duration::days(i64::from(self.token_ttl_days)))
        } else {
            None
        };
        self.inner.write().tokens.insert(
            digest_hex(&token),
            TokenRecord {
                user_id: user_id.to_string(),
                issued_at: Utc::now(),
                expires_at,
            },
        );
        self.flush()?;
        Ok(token)
    }

    fn flush(&self) -> Result<()> {
        let file = self.inner.read();
        write_json_atomic(&self.path, &*file)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hashing helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill(&mut salt);
    let salt_hex = hex(&salt);

    let mut hasher = Sha256::new();
    hasher.update(&salt);
    hasher.update(password.as_bytes());
    format!("{salt_hex}${}", hex(&hasher.finalize()))
}

fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let Some(salt) = unhex(salt_hex) else {
        return false;
    };

    let mut hasher = Sha256::new();
    hasher.update(&salt);
    hasher.update(password.as_bytes());
    let computed = hex(&hasher.finalize());

    computed.as_bytes().ct_eq(digest_hex.as_bytes()).into()
}

fn digest_hex(token: &str) -> String {
    hex(&Sha256::digest(token.as_bytes()))
}

fn mint_token() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::new(dir.path(), 30).unwrap();
        (dir, store)
    }

    #[test]
    fn register_then_login_resolves_same_user() {
        let (_dir, store) = store();
        let (reg, reg_token) = store.register("wang_er", "hunter2", None).unwrap();
        let (login, login_token) = store.login("wang_er", "hunter2").unwrap();

        assert_eq!(reg.user_id, login.user_id);
        assert_eq!(
            store.resolve_token(&reg_token),
            Some(reg.user_id.clone())
        );
        assert_eq!(store.resolve_token(&login_token), Some(reg.user_id));
    }

    #[test]
    fn duplicate_username_rejected() {
        let (_dir, store) = store();
        store.register("alice", "pw", None).unwrap();
        assert!(store.register("alice", "other", None).is_err());
    }

    #[test]
    fn wrong_password_is_unauthorized() {
        let (_dir, store) = store();
        store.register("bob", "right", None).unwrap();
        let err = store.login("bob", "wrong").unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
        // Unknown users produce the same kind.
        let err = store.login("nobody", "x").unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
    }

    #[test]
    fn revoked_token_no_longer_resolves() {
        let (_dir, store) = store();
        let (_, token) = store.register("carol", "pw", None).unwrap();
        assert!(store.resolve_token(&token).is_some());
        store.revoke_token(&token);
        assert!(store.resolve_token(&token).is_none());
        // Revoking again is a no-op.
        store.revoke_token(&token);
    }

    #[test]
    fn tokens_survive_reload_but_raw_tokens_are_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let token = {
            let store = UserStore::new(dir.path(), 30).unwrap();
            let (_, token) = store.register("dave", "pw", None).unwrap();
            token
        };

        let raw = std::fs::read_to_string(dir.path().join("users.json")).unwrap();
        assert!(!raw.contains(&token));

        let store = UserStore::new(dir.path(), 30).unwrap();
        assert!(store.resolve_token(&token).is_some());
    }

    #[test]
    fn delete_user_revokes_tokens() {
        let (_dir, store) = store();
        let (user, token) = store.register("erin", "pw", None).unwrap();
        store.delete_user(&user.user_id).unwrap();
        assert!(store.resolve_token(&token).is_none());
        assert!(store.get(&user.user_id).is_none());
        assert!(store.delete_user(&user.user_id).is_err());
    }

    #[test]
    fn password_hash_is_salted() {
        let a = hash_password("same");
        let b = hash_password("same");
        assert_ne!(a, b);
        assert!(verify_password("same", &a));
        assert!(verify_password("same", &b));
        assert!(!verify_password("different", &a));
    }
}
