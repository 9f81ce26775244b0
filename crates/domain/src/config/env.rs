//! Environment overlay and deep merge for the layered config.
//!
//! `API__BASE_URL=...` sets `api.base_url`; the double underscore denotes
//! nesting in the config tree. Values parse as JSON when they can (numbers,
//! booleans) and fall back to strings.

use serde_json::Value;

/// Config sections that accept environment overrides.
const ENV_SECTIONS: &[&str] = &[
    "SERVER", "API", "SESSIONS", "MEMORY", "TOOLS", "SCHEDULER", "PROMPTS", "PATHS",
];

/// Recursively merge `patch` into `target`: objects merge key-by-key,
/// anything else replaces.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (key, value) in p {
                match t.get_mut(key) {
                    Some(slot) if slot.is_object() && value.is_object() => {
                        deep_merge(slot, value);
                    }
                    _ => {
                        t.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}

/// Apply environment variables onto a config value tree.
///
/// Each variable named `SECTION__SUB__FIELD` becomes the path
/// `section.sub.field`. Unknown sections are ignored so unrelated process
/// environment never leaks into the tree.
pub fn apply_env_overlay<I>(tree: &mut Value, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (name, raw) in vars {
        let Some(section) = name.split("__").next() else {
            continue;
        };
        if !ENV_SECTIONS.contains(&section) {
            continue;
        }

        let path: Vec<String> = name
            .split("__")
            .map(|seg| seg.to_ascii_lowercase())
            .collect();
        if path.iter().any(|seg| seg.is_empty()) {
            continue;
        }

        set_path(tree, &path, parse_env_value(&raw));
    }
}

/// Parse an env value: valid JSON scalars keep their type, everything else
/// is a string. (`true`, `8080`, `0.5` — but never objects/arrays, which
/// would make env diffs unreadable.)
fn parse_env_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_))) => v,
        _ => Value::String(raw.to_string()),
    }
}

fn set_path(tree: &mut Value, path: &[String], value: Value) {
    let mut node = tree;
    for seg in &path[..path.len() - 1] {
        if !node.is_object() {
            *node = Value::Object(Default::default());
        }
        let Some(obj) = node.as_object_mut() else {
            return;
        };
        node = obj
            .entry(seg.clone())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if !node.is_object() {
        *node = Value::Object(Default::default());
    }
    if let Some(obj) = node.as_object_mut() {
        obj.insert(path[path.len() - 1].clone(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_nested_objects() {
        let mut target = json!({"api": {"model": "a", "temperature": 0.7}});
        deep_merge(&mut target, &json!({"api": {"model": "b"}}));
        assert_eq!(target["api"]["model"], "b");
        assert_eq!(target["api"]["temperature"], 0.7);
    }

    #[test]
    fn merge_replaces_scalars_and_arrays() {
        let mut target = json!({"tools": {"allow": ["a", "b"]}});
        deep_merge(&mut target, &json!({"tools": {"allow": ["c"]}}));
        assert_eq!(target["tools"]["allow"], json!(["c"]));
    }

    #[test]
    fn env_overlay_nests_on_double_underscore() {
        let mut tree = json!({});
        apply_env_overlay(
            &mut tree,
            vec![
                ("API__API_KEY".to_string(), "sk-test".to_string()),
                ("API__BASE_URL".to_string(), "http://localhost:9999/v1".to_string()),
                ("MEMORY__NEO4J__ENABLED".to_string(), "true".to_string()),
                ("MEMORY__NEO4J__URI".to_string(), "http://db:7474".to_string()),
            ],
        );
        assert_eq!(tree["api"]["api_key"], "sk-test");
        assert_eq!(tree["memory"]["neo4j"]["enabled"], true);
        assert_eq!(tree["memory"]["neo4j"]["uri"], "http://db:7474");
    }

    #[test]
    fn env_overlay_parses_scalars() {
        let mut tree = json!({});
        apply_env_overlay(
            &mut tree,
            vec![
                ("SERVER__PORT".to_string(), "9001".to_string()),
                ("API__TEMPERATURE".to_string(), "0.2".to_string()),
                ("API__MODEL".to_string(), "gpt-4o".to_string()),
            ],
        );
        assert_eq!(tree["server"]["port"], 9001);
        assert_eq!(tree["api"]["temperature"], 0.2);
        // Model names stay strings even when they look odd.
        assert_eq!(tree["api"]["model"], "gpt-4o");
    }

    #[test]
    fn env_overlay_ignores_unrelated_vars() {
        let mut tree = json!({});
        apply_env_overlay(
            &mut tree,
            vec![
                ("HOME".to_string(), "/root".to_string()),
                ("PATH__HACK".to_string(), "x".to_string()),
                ("LC_ALL".to_string(), "C".to_string()),
            ],
        );
        assert_eq!(tree, json!({}));
    }
}
