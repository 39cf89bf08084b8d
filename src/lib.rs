//! tiercache - Two-tier read-through caching library
//!
//! Each cache name gets:
//! - Local tier: in-memory Moka cache per process (fastest)
//! - Shared tier: Redis, shared by every process
//! - A loader called on a miss in both tiers
//!
//! The cache provides:
//! - Stampede protection: per-key in-process locks plus a cross-process lease, so a key is
//!   loaded at most once at a time system-wide
//! - Penetration protection: a bloom filter of keys ever written, and cached absence
//! - Write-behind propagation to the shared tier through a bounded reconciliation queue
//! - Local invalidation from Redis keyspace notifications
//! - Hit/miss statistics with periodic reporting

mod config;
mod entry;
mod error;
pub mod invalidation;
mod key;
mod local_tier;
mod lock;
mod manager;
pub mod membership;
pub mod memory;
pub mod reconcile;
mod redis_tier;
pub mod stats;
mod tier;
mod two_tier_cache;

pub use config::{CacheConfig, LockStrategy, MembershipConfig, WriteMode};
pub use entry::{CacheEntry, Cacheable, NULL_SENTINEL};
pub use error::{BoxError, CacheError};
pub use key::{KEY_SEPARATOR, KeyNamespace, escape_glob};
pub use local_tier::MokaLocalTier;
pub use lock::{KeyGuard, KeyLocks, Lease, LoadPermit, LockCoordinator, LockProvider};
pub use manager::{CacheManager, FilterFactory};
pub use redis_tier::{
    RedisBloomFilter, RedisKeyspaceNotifications, RedisLockProvider, RedisSharedTier,
};
pub use stats::{StatsMonitor, StatsSnapshot};
pub use tier::{LocalTier, SharedOp, SharedTier};
pub use two_tier_cache::{BatchCache, Cache, TwoTierCache, TwoTierCacheBuilder};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
