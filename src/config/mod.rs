//! Configuration for the used-CSS pipeline

mod fetch;
mod logging;
mod queue;
mod storage;

pub use fetch::FetchConfig;
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use queue::QueueConfig;
pub use storage::{ScheduleConfig, StorageConfig};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default user agent for page and stylesheet requests
pub const DEFAULT_USER_AGENT: &str = "UsedCssBot/0.1 (+stylesheet optimizer)";

/// Longest accepted queue delay (ten years, in seconds)
pub const MAX_DELAY_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Queue database and cache locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Queue processor settings
    #[serde(default)]
    pub queue: QueueConfig,
    /// HTTP fetch settings
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Periodic trigger settings
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML (used by `init`)
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Validate all configuration fields.
    ///
    /// Collects all validation errors and reports them together.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.queue.batch_size == 0 {
            errors.push("batch_size must be positive".to_string());
        }
        if self.queue.max_retries == 0 {
            errors.push("max_retries must be positive".to_string());
        }
        if self.queue.concurrency == 0 {
            errors.push("concurrency must be positive".to_string());
        }
        if self.queue.concurrency > self.queue.batch_size.max(1) {
            errors.push(format!(
                "concurrency ({}) must not exceed batch_size ({})",
                self.queue.concurrency, self.queue.batch_size
            ));
        }
        if self.queue.stale_after_secs <= self.fetch.timeout_secs {
            errors.push("stale_after_secs must be greater than fetch timeout_secs".to_string());
        }
        if self.queue.max_backoff_secs < self.queue.retry_backoff_secs {
            errors.push("max_backoff_secs must be >= retry_backoff_secs".to_string());
        }
        for (name, secs) in [
            ("stale_after_secs", self.queue.stale_after_secs),
            ("retry_backoff_secs", self.queue.retry_backoff_secs),
            ("max_backoff_secs", self.queue.max_backoff_secs),
        ] {
            if secs > MAX_DELAY_SECS {
                errors.push(format!("{} must be at most {} seconds", name, MAX_DELAY_SECS));
            }
        }
        for pattern in &self.queue.disallowed_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("invalid disallowed pattern '{}': {}", pattern, e));
            }
        }

        if self.fetch.timeout_secs == 0 {
            errors.push("fetch timeout_secs must be positive".to_string());
        }
        if self.fetch.max_content_size == 0 {
            errors.push("max_content_size must be positive".to_string());
        }
        if self.fetch.user_agent.trim().is_empty() {
            errors.push("user_agent must not be empty".to_string());
        }

        if self.schedule.interval_secs == 0 {
            errors.push("schedule interval_secs must be positive".to_string());
        }

        if self.storage.data_dir.as_os_str().is_empty() {
            errors.push("data_dir must not be empty".to_string());
        }
        if self.storage.cache_dir.as_os_str().is_empty() {
            errors.push("cache_dir must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}
