use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {field}: must be greater than zero")]
    ZeroValue { field: &'static str },

    #[error("Invalid heartbeat_interval_ms: {0}. Must be at least 1000")]
    HeartbeatTooShort(u64),

    #[error("integration_target_branch cannot be empty")]
    EmptyTargetBranch,

    #[error("codex_cmd cannot be empty")]
    EmptyCodexCmd,

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .cowai/config.yaml (project config)
    /// 3. .cowai/local.yaml (project local overrides, optional)
    /// 4. Environment variables (COWAI_* prefix, nested keys split on `__`)
    pub fn load() -> Result<Config> {
        Self::load_from_dir(Path::new("."))
    }

    /// Same chain as [`ConfigLoader::load`], rooted at `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Config> {
        let config: Config = Self::figment(dir)
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment(dir: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(dir.join(".cowai/config.yaml")))
            .merge(Yaml::file(dir.join(".cowai/local.yaml")))
            .merge(Env::prefixed("COWAI_").split("__"))
    }

    /// Load configuration from a specific file (no environment layer)
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let non_zero = [
            ("auto_claim_interval_ms", config.auto_claim_interval_ms),
            ("auto_execute_interval_ms", config.auto_execute_interval_ms),
            ("auto_execute_timeout_ms", config.auto_execute_timeout_ms),
            (
                "auto_claim_max_doing_per_agent",
                config.auto_claim_max_doing_per_agent as u64,
            ),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ZeroValue { field });
        }

        if config.heartbeat_interval_ms < 1_000 {
            return Err(ConfigError::HeartbeatTooShort(config.heartbeat_interval_ms));
        }

        if config.integration_target_branch.trim().is_empty() {
            return Err(ConfigError::EmptyTargetBranch);
        }

        if config.codex_cmd.trim().is_empty() {
            return Err(ConfigError::EmptyCodexCmd);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        Ok(())
    }
}
