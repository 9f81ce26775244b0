//! Defaults and layering behavior of the config tree.

use ag_domain::config::{apply_env_overlay, deep_merge, Config, ConfigSnapshot};
use serde_json::json;

#[test]
fn empty_json_yields_full_defaults() {
    let cfg: Config = serde_json::from_str("{}").unwrap();
    assert_eq!(cfg.server.port, 8000);
    assert_eq!(cfg.scheduler.workers, 8);
    assert_eq!(cfg.scheduler.queue_depth, 32);
    assert_eq!(cfg.scheduler.max_retries, 3);
    assert_eq!(cfg.scheduler.tool_hops_max, 6);
    assert_eq!(cfg.sessions.history_rounds, 10);
    assert_eq!(cfg.tools.timeout_ms, 30_000);
    assert_eq!(cfg.tools.confirm_ttl_secs, 300);
    assert!(cfg
        .tools
        .confirm_required
        .contains(&"shell.exec".to_string()));
    assert!(!cfg.memory.enabled);
}

#[test]
fn partial_json_keeps_sibling_defaults() {
    let cfg: Config =
        serde_json::from_value(json!({"server": {"port": 9090}, "api": {"model": "m1"}})).unwrap();
    assert_eq!(cfg.server.port, 9090);
    assert_eq!(cfg.server.host, "127.0.0.1");
    assert_eq!(cfg.api.model, "m1");
    assert!(cfg.api.stream);
}

#[test]
fn file_layer_then_env_layer() {
    // defaults -> file -> env, env wins.
    let mut tree = serde_json::to_value(Config::default()).unwrap();
    deep_merge(&mut tree, &json!({"api": {"model": "from-file", "base_url": "http://file"}}));
    apply_env_overlay(
        &mut tree,
        vec![("API__MODEL".to_string(), "from-env".to_string())],
    );
    let cfg: Config = serde_json::from_value(tree).unwrap();
    assert_eq!(cfg.api.model, "from-env");
    assert_eq!(cfg.api.base_url, "http://file");
}

#[test]
fn required_env_subset_round_trips() {
    let mut tree = serde_json::to_value(Config::default()).unwrap();
    apply_env_overlay(
        &mut tree,
        vec![
            ("API__API_KEY".to_string(), "sk-e2e".to_string()),
            ("API__BASE_URL".to_string(), "http://llm:8080/v1".to_string()),
            ("API__MODEL".to_string(), "qwen-plus".to_string()),
            ("MEMORY__ENABLED".to_string(), "true".to_string()),
            ("MEMORY__NEO4J__ENABLED".to_string(), "true".to_string()),
            ("MEMORY__NEO4J__URI".to_string(), "http://neo4j:7474".to_string()),
            ("MEMORY__NEO4J__USERNAME".to_string(), "neo4j".to_string()),
            ("MEMORY__NEO4J__PASSWORD".to_string(), "pw".to_string()),
            ("MEMORY__NEO4J__DATABASE".to_string(), "agents".to_string()),
        ],
    );
    let cfg: Config = serde_json::from_value(tree).unwrap();
    assert_eq!(cfg.api.api_key, "sk-e2e");
    assert!(cfg.memory.enabled);
    assert!(cfg.memory.neo4j.enabled);
    assert_eq!(cfg.memory.neo4j.database, "agents");
    assert_eq!(cfg.memory.neo4j.password, "pw");
}

#[test]
fn full_layer_chain_defaults_file_user_env() {
    // defaults -> system file -> per-user file -> env, each later layer
    // winning where it sets the same key.
    let mut base = serde_json::to_value(Config::default()).unwrap();
    deep_merge(
        &mut base,
        &json!({"api": {"model": "from-file", "temperature": 0.5, "max_tokens": 123}}),
    );
    let user_overlay = json!({"api": {"model": "from-user", "temperature": 0.2}});
    let env = vec![("API__MODEL".to_string(), "from-env".to_string())];

    let snap = ConfigSnapshot::build(&base, Some("u1"), Some(&user_overlay), env).unwrap();
    // env > per-user file:
    assert_eq!(snap.config.api.model, "from-env");
    // per-user file > system file:
    assert!((snap.config.api.temperature - 0.2).abs() < f32::EPSILON);
    // system file > defaults:
    assert_eq!(snap.config.api.max_tokens, 123);
}

#[test]
fn validation_flags_broken_config() {
    let mut cfg = Config::default();
    cfg.server.port = 0;
    cfg.scheduler.workers = 0;
    let issues = cfg.validate();
    assert!(Config::has_errors(&issues));
    assert!(issues.iter().any(|i| i.field == "server.port"));
    assert!(issues.iter().any(|i| i.field == "scheduler.workers"));
}
