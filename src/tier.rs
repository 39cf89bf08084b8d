//! Collaborator contracts for the two tiers
//!
//! The coordinator never talks to moka or Redis directly; it is handed a [`LocalTier`] and a
//! [`SharedTier`]. [`crate::MokaLocalTier`] and [`crate::RedisSharedTier`] are the production
//! implementations, [`crate::memory::InMemorySharedTier`] runs without a server.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::{CacheEntry, CacheError};

/// Process-local, capacity-bounded key/value cache.
///
/// Keys are full cache keys. Eviction policy is the implementation's business.
#[async_trait]
pub trait LocalTier<V>: Send + Sync + 'static
where
    V: Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<CacheEntry<V>>;

    /// Entries present for `keys`; absent keys are omitted
    async fn get_all(&self, keys: &[String]) -> HashMap<String, CacheEntry<V>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.get(key).await {
                found.insert(key.clone(), entry);
            }
        }
        found
    }

    async fn put(&self, key: String, entry: CacheEntry<V>);

    async fn put_all(&self, entries: HashMap<String, CacheEntry<V>>) {
        for (key, entry) in entries {
            self.put(key, entry).await;
        }
    }

    /// Remove `key`, reporting whether it was present
    async fn invalidate(&self, key: &str) -> bool;

    async fn invalidate_many(&self, keys: &[String]) {
        for key in keys {
            self.invalidate(key).await;
        }
    }

    async fn invalidate_all(&self);

    /// Approximate number of live entries
    fn entry_count(&self) -> u64;
}

/// One write of an atomic shared-tier batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharedOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
}

/// Network-accessible store shared by every process.
///
/// Values are opaque strings; the coordinator does the encoding.
#[async_trait]
pub trait SharedTier: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Values for `keys` in the same order, in one round trip
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Store `value` only if `key` holds nothing. Returns whether it was stored.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Returns the number of keys that existed
    async fn delete_all(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Every key starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

    /// Apply all of `ops` or none of them
    async fn apply_batch(&self, ops: Vec<SharedOp>) -> Result<(), CacheError>;
}
