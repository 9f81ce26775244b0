mod env;
mod snapshot;

pub use env::{apply_env_overlay, deep_merge};
pub use snapshot::{reject_secret_fields, ConfigSnapshot, SECRET_KEYS};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The full configuration tree.
///
/// Layering (low → high): embedded defaults, `config/default.json`,
/// per-user `config/users/<user_id>/config.json`, environment overlay —
/// the environment always wins. Defaults + system file form the env-free
/// **base tree**; [`ConfigSnapshot::build`] merges the per-user overlay
/// onto that base and applies the environment last, so a user file can
/// never shadow an env-pinned value.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Seconds given to in-flight turns on shutdown before they are aborted.
    #[serde(default = "d_drain")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            rate_limit: RateLimitConfig::default(),
            drain_timeout_secs: d_drain(),
        }
    }
}

/// Per-user leaky-bucket rate limit for the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity (burst size).
    #[serde(default = "d_rl_capacity")]
    pub capacity: u32,
    /// Steady-state requests per second drained from the bucket.
    #[serde(default = "d_rl_leak")]
    pub leak_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: d_rl_capacity(),
            leak_per_sec: d_rl_leak(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM API
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// LLM provider endpoint settings. `api_key` is accepted **only** from the
/// environment (`API__API_KEY`); user patches naming it are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "d_base_url")]
    pub base_url: String,
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    #[serde(default = "d_max_tokens")]
    pub max_tokens: u32,
    /// Whether `/api/chat` streams by default when the request omits `stream`.
    #[serde(default = "d_true")]
    pub stream: bool,
    /// Deadline for a single LLM HTTP request (connect + stream), ms.
    #[serde(default = "d_llm_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: d_base_url(),
            model: d_model(),
            temperature: d_temperature(),
            max_tokens: d_max_tokens(),
            stream: true,
            request_timeout_ms: d_llm_timeout(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Rounds (user+assistant pairs) of history included in the prompt.
    #[serde(default = "d_history_rounds")]
    pub history_rounds: usize,
    /// Sessions idle longer than this many hours are removed by the
    /// housekeeping sweep. `0` disables time-based cleanup.
    #[serde(default)]
    pub idle_cleanup_hours: u64,
    /// Days until issued auth tokens expire.
    #[serde(default = "d_token_days")]
    pub token_ttl_days: u32,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            history_rounds: d_history_rounds(),
            idle_cleanup_hours: 0,
            token_ttl_days: d_token_days(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Recall can be switched off independently of ingest.
    #[serde(default = "d_true")]
    pub recall: bool,
    /// Deadline for the recall query during prompt assembly; on timeout the
    /// recall block is skipped, never failing the turn.
    #[serde(default = "d_recall_timeout")]
    pub recall_timeout_ms: u64,
    /// Depth of the write-behind ingest channel. Overflow drops the oldest
    /// candidate.
    #[serde(default = "d_ingest_depth")]
    pub ingest_queue_depth: usize,
    /// Maintenance tick period (cluster → summarize → decay), seconds.
    #[serde(default = "d_maintain")]
    pub maintain_interval_secs: u64,
    /// Route the recall gate through the LLM instead of the local heuristic.
    /// Off by default (cost).
    #[serde(default)]
    pub llm_gating: bool,
    #[serde(default)]
    pub neo4j: Neo4jConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            recall: true,
            recall_timeout_ms: d_recall_timeout(),
            ingest_queue_depth: d_ingest_depth(),
            maintain_interval_secs: d_maintain(),
            llm_gating: false,
            neo4j: Neo4jConfig::default(),
        }
    }
}

/// Neo4j connection settings; credentials come from the environment only
/// (`MEMORY__NEO4J__USERNAME` / `MEMORY__NEO4J__PASSWORD`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neo4jConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "d_neo4j_uri")]
    pub uri: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "d_neo4j_db")]
    pub database: String,
    #[serde(default = "d_neo4j_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "d_neo4j_retries")]
    pub max_retries: u32,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uri: d_neo4j_uri(),
            username: String::new(),
            password: String::new(),
            database: d_neo4j_db(),
            timeout_ms: d_neo4j_timeout(),
            max_retries: d_neo4j_retries(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Tools the model may call. Empty means every registered tool.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Tools that require human confirmation before executing.
    #[serde(default = "d_confirm_required")]
    pub confirm_required: Vec<String>,
    /// Default per-invocation timeout, ms.
    #[serde(default = "d_tool_timeout")]
    pub timeout_ms: u64,
    /// Per-tool timeout overrides, ms.
    #[serde(default)]
    pub timeout_overrides_ms: HashMap<String, u64>,
    /// Seconds a pending confirmation stays valid; expiry behaves as reject.
    #[serde(default = "d_confirm_ttl")]
    pub confirm_ttl_secs: u64,
    #[serde(default)]
    pub exec: ExecToolConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            confirm_required: d_confirm_required(),
            timeout_ms: d_tool_timeout(),
            timeout_overrides_ms: HashMap::new(),
            confirm_ttl_secs: d_confirm_ttl(),
            exec: ExecToolConfig::default(),
        }
    }
}

/// Guard rails for the `shell.exec` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecToolConfig {
    /// Log every exec invocation at INFO level.
    #[serde(default = "d_true")]
    pub audit_log: bool,
    /// Regex patterns that are denied outright, before confirmation.
    #[serde(default = "d_denied_patterns")]
    pub denied_patterns: Vec<String>,
    /// Max output chars returned to the model.
    #[serde(default = "d_exec_max_output")]
    pub max_output_chars: usize,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self {
            audit_log: true,
            denied_patterns: d_denied_patterns(),
            max_output_chars: d_exec_max_output(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker pool size (turns running in parallel across sessions).
    #[serde(default = "d_workers")]
    pub workers: usize,
    /// Per-session queue depth; overflow rejects with `Busy`.
    #[serde(default = "d_queue_depth")]
    pub queue_depth: usize,
    /// How long `enqueue` waits for a free worker before `Busy`, ms.
    #[serde(default = "d_acquire_timeout")]
    pub acquire_timeout_ms: u64,
    /// Retries for retriable failures, per work item.
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay, ms; doubles each attempt, with jitter.
    #[serde(default = "d_retry_base")]
    pub retry_base_ms: u64,
    /// Period of the housekeeping sweep (empty queues, expired
    /// confirmations), seconds.
    #[serde(default = "d_sweep")]
    pub sweep_interval_secs: u64,
    /// Max (LLM → tool → LLM) hops within one turn.
    #[serde(default = "d_tool_hops")]
    pub tool_hops_max: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: d_workers(),
            queue_depth: d_queue_depth(),
            acquire_timeout_ms: d_acquire_timeout(),
            max_retries: d_max_retries(),
            retry_base_ms: d_retry_base(),
            sweep_interval_secs: d_sweep(),
            tool_hops_max: d_tool_hops(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompts & paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    /// Base persona. `{agent_name}` is substituted with the effective agent
    /// name before use.
    #[serde(default = "d_system_prompt")]
    pub system_prompt: String,
    /// Default assistant name; users may override per account.
    #[serde(default = "d_agent_name")]
    pub agent_name: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            system_prompt: d_system_prompt(),
            agent_name: d_agent_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root for persisted state (`users.json`, `sessions.json`).
    #[serde(default = "d_state_dir")]
    pub state_dir: PathBuf,
    /// Root of the config tree (`default.json`, `users/<id>/config.json`).
    #[serde(default = "d_config_dir")]
    pub config_dir: PathBuf,
    /// Root for per-user daily conversation logs.
    #[serde(default = "d_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: d_state_dir(),
            config_dir: d_config_dir(),
            log_dir: d_log_dir(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues. An empty vec
    /// means the config is usable; `Error`-severity issues abort startup.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }
        if self.server.host.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }
        if self.api.base_url.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "api.base_url".into(),
                message: "base_url must not be empty".into(),
            });
        }
        if self.api.api_key.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "api.api_key".into(),
                message: "API__API_KEY is not set; LLM calls will fail".into(),
            });
        }
        if self.scheduler.workers == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "scheduler.workers".into(),
                message: "worker pool must have at least one worker".into(),
            });
        }
        if self.scheduler.queue_depth == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "scheduler.queue_depth".into(),
                message: "session queue depth must be at least 1".into(),
            });
        }
        if self.memory.enabled && self.memory.neo4j.enabled {
            if self.memory.neo4j.uri.is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: "memory.neo4j.uri".into(),
                    message: "uri must not be empty when neo4j is enabled".into(),
                });
            }
            if self.memory.neo4j.password.is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    field: "memory.neo4j.password".into(),
                    message: "MEMORY__NEO4J__PASSWORD is not set".into(),
                });
            }
        }
        if self.sessions.history_rounds == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "sessions.history_rounds".into(),
                message: "history disabled; every turn is stateless".into(),
            });
        }

        issues
    }

    pub fn has_errors(issues: &[ConfigIssue]) -> bool {
        issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    8000
}
fn d_drain() -> u64 {
    10
}
fn d_rl_capacity() -> u32 {
    30
}
fn d_rl_leak() -> f64 {
    5.0
}
fn d_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_model() -> String {
    "gpt-4o-mini".into()
}
fn d_temperature() -> f32 {
    0.7
}
fn d_max_tokens() -> u32 {
    2000
}
fn d_llm_timeout() -> u64 {
    120_000
}
fn d_history_rounds() -> usize {
    10
}
fn d_token_days() -> u32 {
    30
}
fn d_recall_timeout() -> u64 {
    2_000
}
fn d_ingest_depth() -> usize {
    256
}
fn d_maintain() -> u64 {
    600
}
fn d_neo4j_uri() -> String {
    "http://127.0.0.1:7474".into()
}
fn d_neo4j_db() -> String {
    "neo4j".into()
}
fn d_neo4j_timeout() -> u64 {
    5_000
}
fn d_neo4j_retries() -> u32 {
    2
}
fn d_confirm_required() -> Vec<String> {
    vec!["shell.exec".into()]
}
fn d_tool_timeout() -> u64 {
    30_000
}
fn d_confirm_ttl() -> u64 {
    300
}
fn d_denied_patterns() -> Vec<String> {
    vec![
        r"rm\s+-rf\s+/".into(),
        r"mkfs\.".into(),
        r"dd\s+if=.+of=/dev/".into(),
    ]
}
fn d_exec_max_output() -> usize {
    100_000
}
fn d_workers() -> usize {
    8
}
fn d_queue_depth() -> usize {
    32
}
fn d_acquire_timeout() -> u64 {
    2_000
}
fn d_max_retries() -> u32 {
    3
}
fn d_retry_base() -> u64 {
    500
}
fn d_sweep() -> u64 {
    60
}
fn d_tool_hops() -> u32 {
    6
}
fn d_true() -> bool {
    true
}
fn d_system_prompt() -> String {
    "You are {agent_name}, a helpful assistant. Answer concisely and use the \
     available tools when they genuinely help."
        .into()
}
fn d_agent_name() -> String {
    "Aria".into()
}
fn d_state_dir() -> PathBuf {
    PathBuf::from("state")
}
fn d_config_dir() -> PathBuf {
    PathBuf::from("config")
}
fn d_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
