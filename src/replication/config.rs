//! Replication Configuration
//!
//! Configuration for catalog replica replication.

use crate::domain::services::RetryPolicy;
use std::time::Duration;

/// Configuration for the replication source and agent.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Whether edits are shipped to secondaries at all (default: true)
    pub enabled: bool,

    /// Maximum edits per shipped batch (default: 100)
    pub batch_max_edits: usize,

    /// How long a shipper waits for a batch to fill up (default: 10ms)
    pub batch_max_delay: Duration,

    /// Maximum queued edits per secondary before the tailer is slowed down (default: 10000)
    pub queue_depth: usize,

    /// Edits read from the WAL per tailer step (default: 256)
    pub tail_batch_edits: usize,

    /// Backoff schedule for failed shipments; when the budget runs out the
    /// secondary's location is re-resolved and the budget starts over
    pub retry: RetryPolicy,

    /// How long a continuously failing secondary is retained before it is abandoned (default: 5min)
    pub secondary_retention: Duration,

    /// Tailed edits after which the primary's WAL segment is rolled into the
    /// archive (default: 1024); archived segments are purged once every live
    /// secondary acknowledged them
    pub wal_roll_edits: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_max_edits: 100,
            batch_max_delay: Duration::from_millis(10),
            queue_depth: 10_000,
            tail_batch_edits: 256,
            retry: RetryPolicy::new(8, Duration::from_millis(50), Duration::from_secs(2)),
            secondary_retention: Duration::from_secs(300),
            wal_roll_edits: 1024,
        }
    }
}

impl ReplicationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable shipping.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the per-batch edit bound.
    pub fn batch_max_edits(mut self, edits: usize) -> Self {
        self.batch_max_edits = edits;
        self
    }

    /// Set the per-batch time bound.
    pub fn batch_max_delay(mut self, delay: Duration) -> Self {
        self.batch_max_delay = delay;
        self
    }

    /// Set the per-secondary queue depth.
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the tailer read size.
    pub fn tail_batch_edits(mut self, edits: usize) -> Self {
        self.tail_batch_edits = edits;
        self
    }

    /// Set the shipping retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the failing-secondary retention bound.
    pub fn secondary_retention(mut self, retention: Duration) -> Self {
        self.secondary_retention = retention;
        self
    }

    /// Set how many tailed edits fill a WAL segment before it is rolled.
    pub fn wal_roll_edits(mut self, edits: usize) -> Self {
        self.wal_roll_edits = edits;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_max_edits == 0 || self.tail_batch_edits == 0 || self.wal_roll_edits == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::ZeroQueueDepth);
        }
        validate_retry(&self.retry)
    }
}

/// Check a retry policy shared by shipping and read routing.
pub fn validate_retry(retry: &RetryPolicy) -> Result<(), ConfigError> {
    if retry.max_attempts == 0 {
        return Err(ConfigError::ZeroRetryBudget);
    }
    if retry.base > retry.max {
        return Err(ConfigError::InvalidBackoff {
            base: retry.base,
            max: retry.max,
        });
    }
    Ok(())
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("queue depth must be at least 1")]
    ZeroQueueDepth,
    #[error("retry budget must allow at least 1 attempt")]
    ZeroRetryBudget,
    #[error("backoff base {base:?} exceeds backoff max {max:?}")]
    InvalidBackoff { base: Duration, max: Duration },
    #[error("replica count must be at least 1")]
    ZeroReplicaCount,
    #[error("cluster needs at least 1 server")]
    ZeroServers,
    #[error("request timeout must be non-zero")]
    ZeroTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReplicationConfig::default();
        assert!(config.enabled);
        assert_eq!(config.batch_max_edits, 100);
        assert_eq!(config.queue_depth, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ReplicationConfig::new()
            .enabled(false)
            .batch_max_edits(5)
            .batch_max_delay(Duration::from_millis(1))
            .queue_depth(50)
            .secondary_retention(Duration::from_secs(1))
            .wal_roll_edits(8);

        assert!(!config.enabled);
        assert_eq!(config.batch_max_edits, 5);
        assert_eq!(config.batch_max_delay, Duration::from_millis(1));
        assert_eq!(config.queue_depth, 50);
        assert_eq!(config.secondary_retention, Duration::from_secs(1));
        assert_eq!(config.wal_roll_edits, 8);
    }

    #[test]
    fn test_validate_zero_batch() {
        let config = ReplicationConfig::new().batch_max_edits(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroBatchSize));
    }

    #[test]
    fn test_validate_zero_roll_size() {
        let config = ReplicationConfig::new().wal_roll_edits(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroBatchSize));
    }

    #[test]
    fn test_validate_zero_queue_depth() {
        let config = ReplicationConfig::new().queue_depth(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroQueueDepth));
    }

    #[test]
    fn test_validate_backoff_order() {
        let retry = RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(1));
        let config = ReplicationConfig::new().retry(retry);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBackoff { .. })
        ));
    }

    #[test]
    fn test_validate_zero_retry_budget() {
        let retry = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1));
        assert_eq!(validate_retry(&retry), Err(ConfigError::ZeroRetryBudget));
    }
}
