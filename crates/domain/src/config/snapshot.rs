//! Immutable per-user configuration snapshots.
//!
//! A snapshot is the fully merged view captured at one instant, assembled
//! low → high: the env-free base tree (embedded defaults + system file),
//! the per-user overlay, then the environment. The environment is applied
//! **last** — a user's config file can never shadow an env-pinned value.
//!
//! Snapshots are published behind an `Arc` and never mutated; a turn holds
//! the snapshot taken at its start for its whole lifetime, so concurrent
//! config updates cannot tear a running turn.

use serde_json::Value;

use super::{apply_env_overlay, deep_merge, Config};
use crate::error::{Error, Result};

/// JSON keys that hold secrets. They are accepted from the environment only:
/// any user or system patch that names one is rejected without a write, and
/// the public view of a snapshot redacts them.
pub const SECRET_KEYS: &[&str] = &["api_key", "password", "username"];

/// The effective configuration for one user at one instant.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Fully merged config tree (base + user overlay + environment).
    pub config: Config,
    /// Effective assistant name for this user.
    pub agent_name: String,
    /// Effective persona prompt with `{agent_name}` already substituted.
    pub system_prompt: String,
    /// The user this snapshot was built for, `None` for the system snapshot.
    pub user_id: Option<String>,
}

impl ConfigSnapshot {
    /// Assemble the effective view. `base` is the env-free tree (embedded
    /// defaults deep-merged with the system file); the user overlay layers
    /// on top of it and the environment on top of everything.
    ///
    /// Persona fields (`agent_name`, `system_prompt`) live at the top level
    /// of the user file, outside the config tree; a user's persona choice
    /// wins over the configured default.
    pub fn build<I>(
        base: &Value,
        user_id: Option<&str>,
        user_overlay: Option<&Value>,
        env: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut tree = base.clone();
        let mut agent_name_override = None;
        let mut prompt_override = None;

        if let Some(overlay) = user_overlay {
            agent_name_override = overlay
                .get("agent_name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned);
            prompt_override = overlay
                .get("system_prompt")
                .and_then(Value::as_str)
                .filter(|prompt| !prompt.trim().is_empty())
                .map(str::to_owned);
            deep_merge(&mut tree, &strip_persona(overlay));
        }

        // Highest-precedence layer: the process environment.
        apply_env_overlay(&mut tree, env);

        let config: Config = serde_json::from_value(tree).map_err(Error::Json)?;
        let agent_name =
            agent_name_override.unwrap_or_else(|| config.prompts.agent_name.clone());
        let prompt_template =
            prompt_override.unwrap_or_else(|| config.prompts.system_prompt.clone());
        let system_prompt = prompt_template.replace("{agent_name}", &agent_name);

        Ok(Self {
            config,
            agent_name,
            system_prompt,
            user_id: user_id.map(str::to_owned),
        })
    }

    /// Snapshot of an already-effective config — no further layers. Used
    /// for the system-level view (where the environment has been applied
    /// during load) and in tests.
    pub fn from_config(config: &Config, user_id: Option<&str>) -> Self {
        let agent_name = config.prompts.agent_name.clone();
        let system_prompt = config
            .prompts
            .system_prompt
            .replace("{agent_name}", &agent_name);
        Self {
            config: config.clone(),
            agent_name,
            system_prompt,
            user_id: user_id.map(str::to_owned),
        }
    }

    /// Non-secret JSON view for `GET /api/config`.
    pub fn public_json(&self) -> Value {
        let mut tree = serde_json::to_value(&self.config).unwrap_or_default();
        redact_secrets(&mut tree);
        if let Some(obj) = tree.as_object_mut() {
            obj.insert("agent_name".into(), Value::String(self.agent_name.clone()));
            obj.insert(
                "system_prompt".into(),
                Value::String(self.system_prompt.clone()),
            );
        }
        tree
    }
}

/// Reject a patch that tries to set any secret-typed field, at any depth.
pub fn reject_secret_fields(patch: &Value) -> Result<()> {
    if let Some(path) = find_secret_path(patch, String::new()) {
        return Err(Error::InvalidArguments(format!(
            "field `{path}` holds a secret and is only accepted from the environment"
        )));
    }
    Ok(())
}

fn find_secret_path(value: &Value, prefix: String) -> Option<String> {
    let obj = value.as_object()?;
    for (key, child) in obj {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if SECRET_KEYS.contains(&key.as_str()) {
            return Some(path);
        }
        if child.is_object() {
            if let Some(found) = find_secret_path(child, path) {
                return Some(found);
            }
        }
    }
    None
}

fn redact_secrets(value: &mut Value) {
    if let Some(obj) = value.as_object_mut() {
        for (key, child) in obj.iter_mut() {
            if SECRET_KEYS.contains(&key.as_str()) {
                if child.as_str().map(|s| !s.is_empty()).unwrap_or(false) {
                    *child = Value::String("<set>".into());
                }
            } else {
                redact_secrets(child);
            }
        }
    }
}

fn strip_persona(overlay: &Value) -> Value {
    let mut clone = overlay.clone();
    if let Some(obj) = clone.as_object_mut() {
        obj.remove("agent_name");
        obj.remove("system_prompt");
    }
    clone
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Value {
        serde_json::to_value(Config::default()).unwrap()
    }

    fn no_env() -> Vec<(String, String)> {
        Vec::new()
    }

    #[test]
    fn snapshot_applies_user_overlay() {
        let overlay = json!({
            "agent_name": "Nova",
            "api": {"temperature": 0.1}
        });
        let snap = ConfigSnapshot::build(&base(), Some("u1"), Some(&overlay), no_env()).unwrap();
        assert_eq!(snap.agent_name, "Nova");
        assert!((snap.config.api.temperature - 0.1).abs() < f32::EPSILON);
        assert!(snap.system_prompt.contains("Nova"));
    }

    #[test]
    fn snapshot_without_overlay_uses_defaults() {
        let system = Config::default();
        let snap = ConfigSnapshot::from_config(&system, None);
        assert_eq!(snap.agent_name, system.prompts.agent_name);
        assert!(snap.system_prompt.contains(&snap.agent_name));
    }

    #[test]
    fn environment_outranks_the_user_overlay() {
        // The user file and the environment set the same key; the
        // environment must win.
        let overlay = json!({"api": {"model": "user-model", "temperature": 0.1}});
        let env = vec![("API__MODEL".to_string(), "env-model".to_string())];

        let snap = ConfigSnapshot::build(&base(), Some("u1"), Some(&overlay), env).unwrap();
        assert_eq!(snap.config.api.model, "env-model");
        // Keys the environment does not pin still come from the user file.
        assert!((snap.config.api.temperature - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn environment_outranks_the_base_tree() {
        let mut tree = base();
        deep_merge(&mut tree, &json!({"server": {"port": 9001}}));
        let env = vec![("SERVER__PORT".to_string(), "9002".to_string())];

        let snap = ConfigSnapshot::build(&tree, None, None, env).unwrap();
        assert_eq!(snap.config.server.port, 9002);
    }

    #[test]
    fn secret_patch_is_rejected() {
        let patch = json!({"api": {"api_key": "sk-sneaky"}});
        assert!(reject_secret_fields(&patch).is_err());

        let nested = json!({"memory": {"neo4j": {"password": "hunter2"}}});
        assert!(reject_secret_fields(&nested).is_err());

        let clean = json!({"api": {"model": "gpt-4o"}, "agent_name": "Nova"});
        assert!(reject_secret_fields(&clean).is_ok());
    }

    #[test]
    fn public_json_redacts_secrets() {
        let mut system = Config::default();
        system.api.api_key = "sk-secret".into();
        let snap = ConfigSnapshot::from_config(&system, None);
        let public = snap.public_json();
        assert_eq!(public["api"]["api_key"], "<set>");
        assert_ne!(public["api"]["api_key"], "sk-secret");
    }

    #[test]
    fn identical_patches_merge_idempotently() {
        let overlay = json!({"api": {"model": "gpt-4o"}});
        let once = ConfigSnapshot::build(&base(), Some("u"), Some(&overlay), no_env()).unwrap();
        let twice = {
            let mut merged = overlay.clone();
            deep_merge(&mut merged, &overlay);
            ConfigSnapshot::build(&base(), Some("u"), Some(&merged), no_env()).unwrap()
        };
        assert_eq!(once.config.api.model, twice.config.api.model);
    }
}
