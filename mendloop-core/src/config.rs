//! Configuration loading with TOML files and environment overrides
//!
//! Every section is `#[serde(default)]`, so a partial file (or none at all)
//! yields a usable configuration. Durations use humantime syntax (`"1h"`,
//! `"15s"`).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MendloopError, MendloopResult};

/// Complete configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Orchestration engine settings
    pub engine: EngineConfig,

    /// Operation history persistence
    pub history: HistoryConfig,

    /// Logging output
    pub logging: LoggingConfig,

    /// In-flight transaction tracking
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Control-loop budget used when a definition does not set one
    #[serde(with = "humantime_serde")]
    pub default_control_loop_timeout: Duration,

    /// Added to every lock hold so the lock outlives the operations it protects
    #[serde(with = "humantime_serde")]
    pub lock_safety_margin: Duration,

    /// Cap on the per-policy step queue
    pub max_steps: usize,

    /// Whether operations are gated by the guard actor
    pub guard_enabled: bool,

    /// Prefix for lock owner ids; the request id is appended
    pub owner_id_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_control_loop_timeout: Duration::from_secs(3600),
            lock_safety_margin: Duration::from_secs(15),
            max_steps: crate::step::MAX_STEPS,
            guard_enabled: true,
            owner_id_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub max_queue_length: usize,
    pub batch_size: usize,
    /// JSON-lines output file; records are kept in memory when unset
    pub path: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_queue_length: 10_000,
            batch_size: 100,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,

    /// In-flight transactions tracked at once; the oldest is evicted beyond this
    pub max_transactions: usize,

    /// In-flight transactions older than this are evicted
    #[serde(with = "humantime_serde")]
    pub transaction_timeout: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_transactions: 100,
            transaction_timeout: Duration::from_secs(3600),
        }
    }
}

impl Config {
    /// Loads, applies environment overrides, and validates.
    pub fn from_file<P: AsRef<Path>>(path: P) -> MendloopResult<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            MendloopError::config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> MendloopResult<Self> {
        toml::from_str(contents)
            .map_err(|e| MendloopError::config(format!("Failed to parse TOML: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("MENDLOOP_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(enabled) = std::env::var("MENDLOOP_GUARD_ENABLED") {
            if let Ok(enabled) = enabled.parse() {
                self.engine.guard_enabled = enabled;
            }
        }
        if let Ok(timeout) = std::env::var("MENDLOOP_CONTROL_LOOP_TIMEOUT") {
            if let Ok(timeout) = humantime_serde::re::humantime::parse_duration(&timeout) {
                self.engine.default_control_loop_timeout = timeout;
            }
        }
        if let Ok(path) = std::env::var("MENDLOOP_HISTORY_PATH") {
            self.history.path = Some(PathBuf::from(path));
        }
        if let Ok(enabled) = std::env::var("MENDLOOP_METRICS_ENABLED") {
            if let Ok(enabled) = enabled.parse() {
                self.metrics.enabled = enabled;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> MendloopResult<()> {
        if self.engine.default_control_loop_timeout.is_zero() {
            return Err(MendloopError::config(
                "Default control loop timeout must be greater than zero",
            ));
        }
        if self.engine.max_steps == 0 {
            return Err(MendloopError::config("max_steps must be at least 1"));
        }
        if self.history.max_queue_length == 0 {
            return Err(MendloopError::config(
                "History max_queue_length must be at least 1",
            ));
        }
        if self.history.batch_size == 0 || self.history.batch_size > self.history.max_queue_length
        {
            return Err(MendloopError::config(
                "History batch_size must be between 1 and max_queue_length",
            ));
        }
        if self.metrics.max_transactions == 0 {
            return Err(MendloopError::config(
                "Metrics max_transactions must be at least 1",
            ));
        }
        if self.metrics.transaction_timeout.is_zero() {
            return Err(MendloopError::config(
                "Metrics transaction_timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}
