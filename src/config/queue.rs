//! Queue processing configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Batch, retry and claim settings for the queue processor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Items attempted per batch
    pub batch_size: usize,
    /// Failed attempts before an item is dead-lettered
    pub max_retries: u32,
    /// Items processed in parallel within a batch (1 = sequential)
    pub concurrency: usize,
    /// Age after which a `processing` item is considered abandoned (seconds)
    pub stale_after_secs: u64,
    /// Delay before the first retry; doubles per recorded failure (seconds)
    pub retry_backoff_secs: u64,
    /// Upper bound on the retry delay (seconds)
    pub max_backoff_secs: u64,
    /// URL patterns (regex) that are never optimized
    pub disallowed_patterns: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_retries: 3,
            concurrency: 1,
            stale_after_secs: 900,
            retry_backoff_secs: 300,
            max_backoff_secs: 3600,
            disallowed_patterns: vec![r"robots\.txt".to_string()],
        }
    }
}

impl QueueConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Delay before an item with `retries` recorded failures may be retried
    pub fn backoff_for(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1).min(16);
        let secs = self
            .retry_backoff_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }
}
