//! Layered configuration with atomic snapshots and change notifications.
//!
//! Merge precedence, low → high: embedded defaults, `config/default.json`,
//! per-user `config/users/<user_id>/config.json`, environment overlay —
//! the environment is the highest layer and overrides the per-user file.
//! The service therefore keeps the **env-free base tree** (defaults +
//! system file); every snapshot build merges the user overlay onto that
//! base and applies the environment on top. Secrets are env-only; patches
//! naming one are rejected before any write.
//!
//! Snapshots are immutable `Arc`s swapped under a short-held lock: a writer
//! builds the new snapshot outside the lock and publishes it with a pointer
//! swap, so readers observe fully-old or fully-new state, never a mix. A
//! turn keeps the snapshot captured at its start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};

use ag_domain::config::{
    apply_env_overlay, deep_merge, reject_secret_fields, Config, ConfigSnapshot,
};
use ag_domain::error::{Error, Result};

use crate::bus::{EventBus, EventKind};

pub struct ConfigService {
    /// Env-free base tree: embedded defaults + default.json. User overlays
    /// merge onto this; the environment is applied on top at build time.
    base: RwLock<Arc<Value>>,
    /// Effective system config (base + environment). Secrets live here.
    system: RwLock<Arc<Config>>,
    system_snapshot: RwLock<Arc<ConfigSnapshot>>,
    config_dir: PathBuf,
    /// The path the system layer was loaded from (and is written back to).
    system_path: PathBuf,
    /// Per-user snapshot cache, invalidated on mutation.
    cache: RwLock<HashMap<String, Arc<ConfigSnapshot>>>,
    bus: EventBus,
}

impl ConfigService {
    /// Build the system layer and service. `config_path` overrides the
    /// default `<config_dir>/default.json` location.
    pub fn init(config_dir: &Path, config_path: Option<&Path>, bus: EventBus) -> Result<Self> {
        let system_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config_dir.join("default.json"));
        let (base, system) = load_system_layers(&system_path)?;
        let system_snapshot = Arc::new(ConfigSnapshot::from_config(&system, None));

        Ok(Self {
            base: RwLock::new(Arc::new(base)),
            system: RwLock::new(Arc::new(system)),
            system_snapshot: RwLock::new(system_snapshot),
            config_dir: config_dir.to_path_buf(),
            system_path,
            cache: RwLock::new(HashMap::new()),
            bus,
        })
    }

    /// The system-level snapshot (no user overlay).
    pub fn system_snapshot(&self) -> Arc<ConfigSnapshot> {
        self.system_snapshot.read().clone()
    }

    pub fn system_config(&self) -> Arc<Config> {
        self.system.read().clone()
    }

    /// The effective snapshot for one user. Cached until the user's config
    /// mutates; readers never see a half-built snapshot.
    pub fn for_user(&self, user_id: &str) -> Arc<ConfigSnapshot> {
        if let Some(snapshot) = self.cache.read().get(user_id) {
            return snapshot.clone();
        }

        let base = self.base.read().clone();
        let overlay = self.read_user_overlay(user_id).ok().flatten();
        let snapshot = ConfigSnapshot::build(
            &base,
            Some(user_id),
            overlay.as_ref(),
            std::env::vars(),
        )
        .map(Arc::new)
        .unwrap_or_else(|e| {
            tracing::warn!(user_id, error = %e, "user overlay unusable, serving system config");
            self.system_snapshot()
        });

        self.cache
            .write()
            .insert(user_id.to_string(), snapshot.clone());
        snapshot
    }

    /// Deep-merge a patch into the user's config file and republish their
    /// snapshot. Secret-typed fields are rejected without a write.
    pub fn update_user(&self, user_id: &str, patch: &Value) -> Result<Arc<ConfigSnapshot>> {
        if !patch.is_object() {
            return Err(Error::InvalidArguments("config patch must be an object".into()));
        }
        reject_secret_fields(patch)?;

        let mut overlay = self
            .read_user_overlay(user_id)?
            .unwrap_or_else(|| json!({}));
        deep_merge(&mut overlay, patch);
        self.write_user_overlay(user_id, &overlay)?;

        // Build outside the cache lock, then swap.
        let base = self.base.read().clone();
        let snapshot = Arc::new(ConfigSnapshot::build(
            &base,
            Some(user_id),
            Some(&overlay),
            std::env::vars(),
        )?);
        self.cache
            .write()
            .insert(user_id.to_string(), snapshot.clone());

        self.bus.emit(
            EventKind::ConfigChanged,
            json!({
                "user_id": user_id,
                "changed": leaf_paths(patch),
            }),
        );
        Ok(snapshot)
    }

    /// Deep-merge a patch into the system file (`default.json`) and
    /// republish every snapshot. Secrets remain env-only here too. The
    /// environment overlay stays on top: an env-pinned value cannot be
    /// overridden through this path.
    pub fn update_system(&self, patch: &Value) -> Result<Arc<ConfigSnapshot>> {
        if !patch.is_object() {
            return Err(Error::InvalidArguments("config patch must be an object".into()));
        }
        reject_secret_fields(patch)?;

        let mut file_layer: Value = if self.system_path.exists() {
            let raw = std::fs::read_to_string(&self.system_path).map_err(Error::Io)?;
            serde_json::from_str(&raw)?
        } else {
            json!({})
        };
        deep_merge(&mut file_layer, patch);

        if let Some(parent) = self.system_path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        let tmp = self.system_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&file_layer)?).map_err(Error::Io)?;
        std::fs::rename(&tmp, &self.system_path).map_err(Error::Io)?;

        // Rebuild outside the locks, publish with pointer swaps.
        let (base, system) = load_system_layers(&self.system_path)?;
        let snapshot = Arc::new(ConfigSnapshot::from_config(&system, None));
        *self.base.write() = Arc::new(base);
        *self.system.write() = Arc::new(system);
        *self.system_snapshot.write() = snapshot.clone();
        // Every user snapshot layered on the old system state is stale.
        self.cache.write().clear();

        self.bus.emit(
            EventKind::ConfigChanged,
            json!({
                "user_id": Value::Null,
                "changed": leaf_paths(patch),
            }),
        );
        Ok(snapshot)
    }

    /// Remove the user's overlay entirely.
    pub fn reset_user(&self, user_id: &str) -> Result<()> {
        let path = self.user_config_path(user_id);
        if path.exists() {
            std::fs::remove_file(&path).map_err(Error::Io)?;
        }
        self.cache.write().remove(user_id);

        self.bus.emit(
            EventKind::ConfigChanged,
            json!({"user_id": user_id, "changed": ["*reset*"]}),
        );
        Ok(())
    }

    /// Forget a user's cached snapshot and file (account deletion).
    pub fn purge_user(&self, user_id: &str) {
        let _ = self.reset_user(user_id);
        if let Some(dir) = self.user_config_path(user_id).parent() {
            let _ = std::fs::remove_dir(dir);
        }
    }

    // ── doctor support ───────────────────────────────────────────────

    /// Validate every user config file; back up and reset files that no
    /// longer parse. Returns `(checked, repaired, backups)`.
    pub fn migrate_user_configs(&self) -> Result<(usize, usize, Vec<String>)> {
        let users_dir = self.config_dir.join("users");
        if !users_dir.exists() {
            return Ok((0, 0, Vec::new()));
        }

        let mut checked = 0usize;
        let mut repaired = 0usize;
        let mut backups = Vec::new();

        for entry in std::fs::read_dir(&users_dir).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            let path = entry.path().join("config.json");
            if !path.exists() {
                continue;
            }
            checked += 1;

            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            let parsed: std::result::Result<Value, _> = serde_json::from_str(&raw);
            let broken = match parsed {
                Ok(v) => !v.is_object(),
                Err(_) => true,
            };
            if !broken {
                continue;
            }

            let backup = path.with_extension(format!(
                "json.bak-{}",
                chrono::Utc::now().format("%Y%m%d%H%M%S")
            ));
            std::fs::rename(&path, &backup).map_err(Error::Io)?;
            std::fs::write(&path, "{}").map_err(Error::Io)?;
            backups.push(backup.display().to_string());
            repaired += 1;

            if let Some(user_id) = entry.file_name().to_str() {
                self.cache.write().remove(user_id);
            }
        }

        Ok((checked, repaired, backups))
    }

    // ── file helpers ─────────────────────────────────────────────────

    fn user_config_path(&self, user_id: &str) -> PathBuf {
        self.config_dir.join("users").join(user_id).join("config.json")
    }

    fn read_user_overlay(&self, user_id: &str) -> Result<Option<Value>> {
        let path = self.user_config_path(user_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn write_user_overlay(&self, user_id: &str, overlay: &Value) -> Result<()> {
        let path = self.user_config_path(user_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(overlay)?).map_err(Error::Io)?;
        std::fs::rename(&tmp, &path).map_err(Error::Io)?;
        Ok(())
    }
}

/// Load the system layers: the env-free base tree (defaults deep-merged
/// with the system file) and the effective system config (base +
/// environment). User snapshots layer onto the base, never the effective
/// config — the environment must stay the top layer.
fn load_system_layers(system_path: &Path) -> Result<(Value, Config)> {
    let mut base = serde_json::to_value(Config::default())?;

    if system_path.exists() {
        let raw = std::fs::read_to_string(system_path).map_err(Error::Io)?;
        let file_layer: Value = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", system_path.display())))?;
        deep_merge(&mut base, &file_layer);
        tracing::info!(path = %system_path.display(), "system config loaded");
    } else {
        tracing::warn!(path = %system_path.display(), "config file not found, using defaults");
    }

    let mut effective = base.clone();
    apply_env_overlay(&mut effective, std::env::vars());
    let system: Config =
        serde_json::from_value(effective).map_err(|e| Error::Config(e.to_string()))?;
    Ok((base, system))
}

/// The dotted leaf paths of a patch, for `config.changed` payloads.
fn leaf_paths(patch: &Value) -> Vec<String> {
    fn walk(value: &Value, prefix: String, out: &mut Vec<String>) {
        match value.as_object() {
            Some(obj) if !obj.is_empty() => {
                for (key, child) in obj {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(child, path, out);
                }
            }
            _ => out.push(prefix),
        }
    }
    let mut out = Vec::new();
    walk(patch, String::new(), &mut out);
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &Path) -> ConfigService {
        ConfigService::init(dir, None, EventBus::new()).unwrap()
    }

    #[test]
    fn user_patch_layers_over_system() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let before = service.for_user("u1");
        assert_eq!(before.config.api.model, Config::default().api.model);

        service
            .update_user("u1", &json!({"api": {"model": "per-user-model"}}))
            .unwrap();
        let after = service.for_user("u1");
        assert_eq!(after.config.api.model, "per-user-model");

        // Other users are untouched.
        assert_eq!(
            service.for_user("u2").config.api.model,
            Config::default().api.model
        );
    }

    #[test]
    fn secret_patches_are_rejected_without_write() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let err = service
            .update_user("u1", &json!({"api": {"api_key": "sk-sneaky"}}))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
        assert!(!dir.path().join("users/u1/config.json").exists());
    }

    #[test]
    fn update_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let patch = json!({"api": {"temperature": 0.3}, "agent_name": "Nova"});

        service.update_user("u1", &patch).unwrap();
        let first = service.for_user("u1");
        service.update_user("u1", &patch).unwrap();
        let second = service.for_user("u1");

        assert_eq!(first.agent_name, second.agent_name);
        assert_eq!(
            first.config.api.temperature,
            second.config.api.temperature
        );
    }

    #[test]
    fn reset_restores_system_values() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        service
            .update_user("u1", &json!({"agent_name": "Custom"}))
            .unwrap();
        assert_eq!(service.for_user("u1").agent_name, "Custom");

        service.reset_user("u1").unwrap();
        assert_eq!(
            service.for_user("u1").agent_name,
            Config::default().prompts.agent_name
        );
    }

    #[test]
    fn snapshots_are_stable_references() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        // A turn captures its snapshot; a later update must not mutate it.
        let captured = service.for_user("u1");
        service
            .update_user("u1", &json!({"api": {"model": "changed"}}))
            .unwrap();
        assert_eq!(captured.config.api.model, Config::default().api.model);
        assert_eq!(service.for_user("u1").config.api.model, "changed");
    }

    #[test]
    fn config_changed_event_carries_paths() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let mut rx = bus.raw_subscribe();
        let service = ConfigService::init(dir.path(), None, bus).unwrap();

        service
            .update_user("u1", &json!({"api": {"model": "m"}, "sessions": {"history_rounds": 4}}))
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::ConfigChanged);
        let changed = event.payload["changed"].as_array().unwrap();
        assert!(changed.iter().any(|p| p == "api.model"));
        assert!(changed.iter().any(|p| p == "sessions.history_rounds"));
    }

    #[test]
    fn migrate_repairs_corrupt_user_files() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        service.update_user("u1", &json!({"agent_name": "A"})).unwrap();
        let broken = dir.path().join("users/u2/config.json");
        std::fs::create_dir_all(broken.parent().unwrap()).unwrap();
        std::fs::write(&broken, "{not json").unwrap();

        let (checked, repaired, backups) = service.migrate_user_configs().unwrap();
        assert_eq!(checked, 2);
        assert_eq!(repaired, 1);
        assert_eq!(backups.len(), 1);
        // The repaired file is now a valid empty overlay.
        let raw = std::fs::read_to_string(&broken).unwrap();
        assert_eq!(raw, "{}");
    }

    #[test]
    fn environment_outranks_a_user_override_of_the_same_key() {
        // A key no other test asserts, to keep the process-wide env var
        // from interfering across parallel tests.
        std::env::set_var("SERVER__DRAIN_TIMEOUT_SECS", "99");

        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        // The user file pins the same key the environment pins.
        service
            .update_user("u1", &json!({"server": {"drain_timeout_secs": 5}}))
            .unwrap();
        assert_eq!(service.for_user("u1").config.server.drain_timeout_secs, 99);

        // The overlay still applies to keys the environment leaves alone.
        service
            .update_user("u1", &json!({"server": {"port": 9005}}))
            .unwrap();
        let snap = service.for_user("u1");
        assert_eq!(snap.config.server.port, 9005);
        assert_eq!(snap.config.server.drain_timeout_secs, 99);

        // The effective system config carries the env value too.
        assert_eq!(service.system_config().server.drain_timeout_secs, 99);

        std::env::remove_var("SERVER__DRAIN_TIMEOUT_SECS");
    }

    #[test]
    fn system_update_reaches_every_user() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        service
            .update_user("u1", &json!({"api": {"temperature": 0.1}}))
            .unwrap();

        service
            .update_system(&json!({"sessions": {"history_rounds": 4}}))
            .unwrap();

        // The system value propagates; the user overlay survives on top.
        let snap = service.for_user("u1");
        assert_eq!(snap.config.sessions.history_rounds, 4);
        assert!((snap.config.api.temperature - 0.1).abs() < f32::EPSILON);
        assert_eq!(service.system_config().sessions.history_rounds, 4);

        // And it persisted to default.json.
        let raw = std::fs::read_to_string(dir.path().join("default.json")).unwrap();
        assert!(raw.contains("history_rounds"));
    }

    #[test]
    fn system_update_rejects_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let err = service
            .update_system(&json!({"api": {"api_key": "sk-x"}}))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
        assert!(!dir.path().join("default.json").exists());
    }

    #[test]
    fn default_json_layers_between_defaults_and_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.json"),
            json!({"sessions": {"history_rounds": 3}}).to_string(),
        )
        .unwrap();

        let service = service(dir.path());
        assert_eq!(service.system_config().sessions.history_rounds, 3);
    }
}
