mod database;
mod observability;

pub use database::DatabaseConfig;
pub use observability::{LoggingConfig, ObservabilityConfig};

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepflowError};
use crate::retry::{BackoffStrategy, RetryPolicy};

/// Root configuration for STEPFLOW.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepflowConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Step retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Gateway configuration.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl StepflowConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| StepflowError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content)?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| StepflowError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration backed by PostgreSQL.
    pub fn default_with_database_url(url: &str) -> Self {
        Self {
            database: DatabaseConfig {
                url: url.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.max_concurrent_runs == 0 {
            return Err(StepflowError::Config(
                "worker.max_concurrent_runs must be at least 1".into(),
            ));
        }
        if self.worker.queue_capacity == 0 {
            return Err(StepflowError::Config(
                "worker.queue_capacity must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(StepflowError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(StepflowError::Config(format!(
                "retry.jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        Ok(())
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum runs executing at once.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Capacity of the in-process run queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Unfinished runs read per page during startup recovery.
    #[serde(default = "default_recovery_page_size")]
    pub recovery_page_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            queue_capacity: default_queue_capacity(),
            recovery_page_size: default_recovery_page_size(),
        }
    }
}

fn default_max_concurrent_runs() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_recovery_page_size() -> usize {
    500
}

/// Step retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per step, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound for a single delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Fraction of the delay added as jitter.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::from(self)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter: default_jitter(),
            backoff: BackoffStrategy::default(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
            backoff: config.backoff,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    300_000
}

fn default_jitter() -> f64 {
    0.2
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port.
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

/// Substitute environment variables in the format ${VAR_NAME}.
///
/// Unset variables are left as written.
fn substitute_env_vars(content: &str) -> Result<String> {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| StepflowError::Internal(e.to_string()))?;

    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }

    Ok(result)
}
