//! Configuration management for Tollgate.
//!
//! Every section has defaults, so an empty YAML document is a valid
//! configuration. Limiter constructors validate their section before any
//! instance is usable.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Fixed window limiter settings
    #[serde(default)]
    pub fixed_window: FixedWindowConfig,

    /// Token bucket limiter settings
    #[serde(default)]
    pub token_bucket: TokenBucketConfig,

    /// Leaky bucket limiter settings
    #[serde(default)]
    pub leaky_bucket: LeakyBucketConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Fixed window limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedWindowConfig {
    /// Length of one counting window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Admissions allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
}

impl Default for FixedWindowConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
        }
    }
}

fn default_window_ms() -> u64 {
    2000
}

fn default_max_requests() -> u64 {
    5
}

impl FixedWindowConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Reject zero-valued settings.
    pub fn validate(&self) -> Result<()> {
        require_positive("fixed_window.window_ms", self.window_ms)?;
        require_positive("fixed_window.max_requests", self.max_requests)
    }
}

/// Token bucket limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Maximum token balance
    #[serde(default = "default_token_capacity")]
    pub capacity: u64,

    /// Tokens added on every refill tick
    #[serde(default = "default_tokens_per_refill")]
    pub tokens_per_refill: u64,

    /// Refill tick period in milliseconds
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: default_token_capacity(),
            tokens_per_refill: default_tokens_per_refill(),
            refill_interval_ms: default_refill_interval_ms(),
        }
    }
}

fn default_token_capacity() -> u64 {
    5
}

fn default_tokens_per_refill() -> u64 {
    2
}

fn default_refill_interval_ms() -> u64 {
    1000
}

impl TokenBucketConfig {
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    /// Reject zero-valued settings.
    pub fn validate(&self) -> Result<()> {
        require_positive("token_bucket.capacity", self.capacity)?;
        require_positive("token_bucket.tokens_per_refill", self.tokens_per_refill)?;
        require_positive("token_bucket.refill_interval_ms", self.refill_interval_ms)
    }
}

/// Leaky bucket limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakyBucketConfig {
    /// Maximum total queued weight
    #[serde(default = "default_bucket_capacity")]
    pub capacity: u64,

    /// Maximum weight transmitted per tick
    #[serde(default = "default_leak_per_tick")]
    pub leak_per_tick: u64,

    /// Drain tick period in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for LeakyBucketConfig {
    fn default() -> Self {
        Self {
            capacity: default_bucket_capacity(),
            leak_per_tick: default_leak_per_tick(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn default_bucket_capacity() -> u64 {
    20
}

fn default_leak_per_tick() -> u64 {
    7
}

fn default_tick_interval_ms() -> u64 {
    500
}

impl LeakyBucketConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Reject zero-valued settings.
    pub fn validate(&self) -> Result<()> {
        require_positive("leaky_bucket.capacity", self.capacity)?;
        require_positive("leaky_bucket.leak_per_tick", self.leak_per_tick)?;
        require_positive("leaky_bucket.tick_interval_ms", self.tick_interval_ms)
    }
}

pub(crate) fn require_positive(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(TollgateError::Config(format!(
            "{} must be greater than zero",
            field
        )));
    }
    Ok(())
}

pub(crate) fn require_nonzero_duration(field: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(TollgateError::Config(format!(
            "{} must be greater than zero",
            field
        )));
    }
    Ok(())
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every limiter section.
    pub fn validate(&self) -> Result<()> {
        self.fixed_window.validate()?;
        self.token_bucket.validate()?;
        self.leaky_bucket.validate()
    }
}
