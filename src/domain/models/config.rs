use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

/// Main configuration structure for cowai
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Run the auto-claim loop
    #[serde(default, deserialize_with = "flexible_bool")]
    pub auto_claim: bool,

    #[serde(default = "default_interval_ms")]
    pub auto_claim_interval_ms: u64,

    /// Maximum number of `doing` tasks per agent before auto-claim skips it
    #[serde(default = "default_max_doing")]
    pub auto_claim_max_doing_per_agent: usize,

    /// Run the auto-execute loop
    #[serde(default, deserialize_with = "flexible_bool")]
    pub auto_execute: bool,

    /// Legacy switch that also enables auto-execute
    #[serde(default, deserialize_with = "flexible_bool")]
    pub enable_workflow_execution: bool,

    #[serde(default = "default_interval_ms")]
    pub auto_execute_interval_ms: u64,

    /// Timeout for one agent invocation
    #[serde(default = "default_execute_timeout_ms")]
    pub auto_execute_timeout_ms: u64,

    #[serde(default, deserialize_with = "flexible_bool")]
    pub auto_verify_on_execute: bool,

    /// Chain every acceptance stage after a successful execution
    #[serde(default, deserialize_with = "flexible_bool")]
    pub auto_accept_on_execute: bool,

    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,

    /// Branch that accepted work is cherry-picked onto
    #[serde(default = "default_target_branch")]
    pub integration_target_branch: String,

    #[serde(default = "default_workers_file")]
    pub workers_file: PathBuf,

    #[serde(default = "default_activity_log_file")]
    pub activity_log_file: PathBuf,

    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Coding agent command
    #[serde(default = "default_codex_cmd")]
    pub codex_cmd: String,

    /// Grace period between SIGTERM and SIGKILL on timeout
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    #[serde(default)]
    pub logging: LoggingConfig,
}

const fn default_interval_ms() -> u64 {
    5_000
}

const fn default_max_doing() -> usize {
    1
}

const fn default_execute_timeout_ms() -> u64 {
    1_200_000
}

const fn default_heartbeat_ms() -> u64 {
    10_000
}

const fn default_kill_grace_ms() -> u64 {
    5_000
}

fn default_target_branch() -> String {
    "main".to_string()
}

fn default_workers_file() -> PathBuf {
    PathBuf::from("settings/workers.yaml")
}

fn default_activity_log_file() -> PathBuf {
    PathBuf::from("logs/activity.ndjson")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("logs/state.json")
}

fn default_codex_cmd() -> String {
    std::env::var("CODEX_CMD")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "codex".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_claim: false,
            auto_claim_interval_ms: default_interval_ms(),
            auto_claim_max_doing_per_agent: default_max_doing(),
            auto_execute: false,
            enable_workflow_execution: false,
            auto_execute_interval_ms: default_interval_ms(),
            auto_execute_timeout_ms: default_execute_timeout_ms(),
            auto_verify_on_execute: false,
            auto_accept_on_execute: false,
            heartbeat_interval_ms: default_heartbeat_ms(),
            integration_target_branch: default_target_branch(),
            workers_file: default_workers_file(),
            activity_log_file: default_activity_log_file(),
            state_file: default_state_file(),
            codex_cmd: default_codex_cmd(),
            kill_grace_ms: default_kill_grace_ms(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Whether the auto-execute loop should run.
    pub fn auto_execute_enabled(&self) -> bool {
        self.auto_execute || self.enable_workflow_execution
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; console only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Mirror logs to stderr
    #[serde(default = "default_true", deserialize_with = "flexible_bool")]
    pub enable_console: bool,

    /// Rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// Number of days to retain logs
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            enable_console: true,
            rotation: default_rotation(),
            retention_days: default_retention_days(),
        }
    }
}

/// Accept `true/false`, `1/0`, `yes/no` and `on/off`.
///
/// Environment overrides arrive as strings or integers depending on how
/// figment parsed them.
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    match Flexible::deserialize(deserializer)? {
        Flexible::Bool(b) => Ok(b),
        Flexible::Int(i) => Ok(i != 0),
        Flexible::Text(s) => parse_flag(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid boolean flag: {s}"))),
    }
}

/// Parse a boolean-ish flag string.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
