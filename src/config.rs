//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{RuleConfig, RuleMatcher};
use crate::store::DEFAULT_KEY_PREFIX;

/// Environment variable prefix for overrides, e.g.
/// `GATEKEEPER_LIMITER__GRACEFUL_DEGRADATION=false`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Limiter behaviour
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Distributed store connection
    #[serde(default)]
    pub store: StoreSettings,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rules, in evaluation order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Global limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Fall back to the local store when the distributed store fails.
    /// When false, such checks are denied.
    #[serde(default = "default_graceful_degradation")]
    pub graceful_degradation: bool,

    /// Seconds between cleanup loop ticks
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Upper bound on keys held by the local store
    #[serde(default = "default_local_store_max_entries")]
    pub local_store_max_entries: usize,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            graceful_degradation: default_graceful_degradation(),
            cleanup_interval_secs: default_cleanup_interval(),
            local_store_max_entries: default_local_store_max_entries(),
        }
    }
}

impl LimiterSettings {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

fn default_graceful_degradation() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_local_store_max_entries() -> usize {
    100_000
}

/// Distributed store settings. Without a `redis_url` the limiter runs
/// on the local store only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    /// Namespace for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            timeout_ms: default_store_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl StoreSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

fn default_store_timeout() -> u64 {
    50
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatekeeperConfig {
    /// Load configuration from a file, with environment overrides on top.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GatekeeperError::Config(format!(
                "configuration file {} not found",
                path.display()
            )));
        }

        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Compile the configured rules, failing on the first invalid one.
    pub fn build_matcher(&self) -> Result<RuleMatcher> {
        RuleMatcher::from_configs(&self.rules)
    }
}
