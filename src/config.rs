//! Cache configuration

use std::time::Duration;

use crate::CacheError;

/// How `put` propagates a value to the shared tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Enqueue the shared write and return once the local tier is updated.
    #[default]
    WriteBehind,
    /// Write the shared tier before returning; on failure the write is re-queued.
    WriteThrough,
}

/// Which locks guard a load on a local miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockStrategy {
    /// Per-key in-process lock only. Enough when a single process owns the shared tier.
    Local,
    /// Per-key in-process lock, then a cross-process lease.
    #[default]
    Distributed,
}

/// Sizing for the per-cache membership filter
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Skip tier lookups for keys the filter has never seen
    pub enabled: bool,
    /// Expected number of distinct keys for the cache name
    pub expected_items: u64,
    /// Target false-positive rate at `expected_items`
    pub false_positive_rate: f64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expected_items: 100_000,
            false_positive_rate: 0.03,
        }
    }
}

/// Configuration for the two-tier cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Application segment of every cache key
    pub app_name: String,
    /// Segment between the application name and the cache name
    pub key_prefix: String,
    /// Maximum number of entries in the local tier
    pub local_max_capacity: u64,
    /// Time-to-live for local entries
    pub local_ttl: Duration,
    /// Time-to-live for shared (Redis) entries; `None` keeps them until evicted
    pub shared_ttl: Option<Duration>,
    /// Cache "no value" loader results as a null sentinel
    pub cache_null_values: bool,
    /// Time-to-live of the null sentinel in both tiers
    pub null_ttl: Duration,
    pub membership: MembershipConfig,
    pub lock_strategy: LockStrategy,
    /// How long a load waits for the cross-process lease
    pub lock_wait_timeout: Duration,
    /// Lease duration; must exceed the slowest loader
    pub lock_lease_timeout: Duration,
    pub write_mode: WriteMode,
    /// Bound of the reconciliation queue
    pub queue_capacity: usize,
    /// Attempts per change record before it is dropped
    pub max_apply_attempts: u32,
    /// Pause between attempts of a failing change record
    pub apply_retry_backoff: Duration,
    /// Evict local entries on shared-tier key events
    pub enable_invalidation: bool,
    /// How long a shared write by this process suppresses its own `set` event
    pub self_write_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            app_name: "app".to_owned(),
            key_prefix: "cache".to_owned(),
            local_max_capacity: 10_240,
            local_ttl: Duration::from_secs(3600), // 1 hour
            shared_ttl: Some(Duration::from_secs(900)), // 15 minutes
            cache_null_values: true,
            null_ttl: Duration::from_secs(300), // 5 minutes
            membership: MembershipConfig::default(),
            lock_strategy: LockStrategy::default(),
            lock_wait_timeout: Duration::from_secs(3),
            lock_lease_timeout: Duration::from_secs(30),
            write_mode: WriteMode::default(),
            queue_capacity: 1024,
            max_apply_attempts: 3,
            apply_retry_backoff: Duration::from_millis(100),
            enable_invalidation: true,
            self_write_window: Duration::from_secs(10),
        }
    }
}

impl CacheConfig {
    /// Reject settings the cache cannot run with.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.local_max_capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "local_max_capacity must be greater than zero".to_owned(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "queue_capacity must be greater than zero".to_owned(),
            ));
        }
        if self.max_apply_attempts == 0 {
            return Err(CacheError::InvalidConfig(
                "max_apply_attempts must be at least 1".to_owned(),
            ));
        }
        if self.null_ttl.is_zero() {
            return Err(CacheError::InvalidConfig("null_ttl must be non-zero".to_owned()));
        }
        if self.lock_lease_timeout.is_zero() {
            return Err(CacheError::InvalidConfig(
                "lock_lease_timeout must be non-zero".to_owned(),
            ));
        }
        let membership = &self.membership;
        if membership.enabled
            && (membership.expected_items == 0
                || !(membership.false_positive_rate > 0.0 && membership.false_positive_rate < 1.0))
        {
            return Err(CacheError::InvalidConfig(format!(
                "membership filter needs expected_items > 0 and 0 < false_positive_rate < 1 (got {} / {})",
                membership.expected_items, membership.false_positive_rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.null_ttl, Duration::from_secs(300));
        assert_eq!(config.write_mode, WriteMode::WriteBehind);
        assert_eq!(config.lock_strategy, LockStrategy::Distributed);
    }

    #[test]
    fn test_rejects_bad_filter_rate() {
        let mut config = CacheConfig::default();
        config.membership.false_positive_rate = 1.5;
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));

        // A disabled filter is not sized at all
        config.membership.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_queue() {
        let config = CacheConfig {
            queue_capacity: 0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
