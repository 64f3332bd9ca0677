pub mod loader;
pub mod validator;
pub mod watcher;

use crate::rules::Rule;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Complete application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Redis configuration (loaded from environment variables only)
    pub redis: RedisConfig,

    /// Decision policy knobs
    pub limiter: LimiterSettings,

    /// Optional JSON file of rules upserted at startup and on change
    pub rules_file: Option<PathBuf>,
}

/// Redis connection configuration (loaded from environment variables)
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Maximum number of connections in pool
    pub max_connections: usize,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Command timeout in seconds
    pub command_timeout_secs: u64,
}

impl RedisConfig {
    /// Load Redis configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("REDIS_CLUSTER_URL").unwrap_or(defaults.url),
            max_connections: env_parse("REDIS_MAX_CONN").unwrap_or(defaults.max_connections),
            connection_timeout_secs: env_parse("REDIS_CONNECT_TIMEOUT_SECS")
                .unwrap_or(defaults.connection_timeout_secs),
            command_timeout_secs: env_parse("REDIS_COMMAND_TIMEOUT_SECS")
                .unwrap_or(defaults.command_timeout_secs),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_connections: 50,
            connection_timeout_secs: 5,
            command_timeout_secs: 2,
        }
    }
}

/// Policy constants for timing hints and store time bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterSettings {
    /// Retry hint when the bucket store faults
    pub fail_closed_retry_ms: u64,

    /// Retry hint when a denying rule never refills
    pub no_refill_retry_secs: u64,

    /// Ceiling for computed retry hints
    pub max_retry_secs: u64,

    /// Upper bound on one rule lookup or bucket consume
    pub store_timeout: Duration,
}

impl LimiterSettings {
    pub fn from_env(store_timeout: Duration) -> Self {
        let defaults = Self::default();
        Self {
            fail_closed_retry_ms: env_parse("TOLLGATE_FAIL_CLOSED_RETRY_MS")
                .unwrap_or(defaults.fail_closed_retry_ms),
            no_refill_retry_secs: env_parse("TOLLGATE_NO_REFILL_RETRY_SECS")
                .unwrap_or(defaults.no_refill_retry_secs),
            max_retry_secs: env_parse("TOLLGATE_MAX_RETRY_SECS")
                .unwrap_or(defaults.max_retry_secs),
            store_timeout,
        }
    }
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            fail_closed_retry_ms: 1_000,
            no_refill_retry_secs: 3_600,
            max_retry_secs: 86_400,
            store_timeout: Duration::from_secs(2),
        }
    }
}

/// Rule seed file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSeedConfig {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
