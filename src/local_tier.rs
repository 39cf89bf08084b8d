//! Moka-backed local tier

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;

use crate::{CacheConfig, CacheEntry, LocalTier};

/// Gives null sentinels their own short lifetime; values follow the cache-wide TTL.
struct SentinelExpiry {
    null_ttl: Duration,
}

impl<V> Expiry<String, CacheEntry<V>> for SentinelExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.is_null().then_some(self.null_ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.is_null().then_some(self.null_ttl)
    }
}

/// Local tier on a `moka::future::Cache`, one per cache name
pub struct MokaLocalTier<V> {
    cache: Cache<String, CacheEntry<V>>,
}

impl<V> Clone for MokaLocalTier<V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<V: Send + Sync + 'static> MokaLocalTier<V> {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.local_max_capacity)
            .time_to_live(config.local_ttl)
            .expire_after(SentinelExpiry {
                null_ttl: config.null_ttl,
            })
            .build();
        Self { cache }
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> LocalTier<V> for MokaLocalTier<V> {
    async fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        self.cache.get(key).await
    }

    async fn put(&self, key: String, entry: CacheEntry<V>) {
        self.cache.insert(key, entry).await;
    }

    async fn invalidate(&self, key: &str) -> bool {
        self.cache.remove(key).await.is_some()
    }

    async fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier() -> MokaLocalTier<String> {
        MokaLocalTier::new(&CacheConfig::default())
    }

    #[tokio::test]
    async fn test_put_get_invalidate() {
        let local = tier();
        local.put("k".to_owned(), CacheEntry::value("v".to_owned())).await;
        assert!(matches!(local.get("k").await, Some(CacheEntry::Value(v)) if v.as_str() == "v"));
        assert!(local.invalidate("k").await);
        assert!(!local.invalidate("k").await);
        assert!(local.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_null_sentinel_expires_on_its_own_ttl() {
        let config = CacheConfig {
            null_ttl: Duration::from_millis(50),
            ..CacheConfig::default()
        };
        let local: MokaLocalTier<String> = MokaLocalTier::new(&config);
        local.put("missing".to_owned(), CacheEntry::Null).await;
        local.put("present".to_owned(), CacheEntry::value("v".to_owned())).await;
        assert!(local.get("missing").await.is_some_and(|e| e.is_null()));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(local.get("missing").await.is_none());
        assert!(local.get("present").await.is_some());
    }

    #[tokio::test]
    async fn test_get_all_omits_absent_keys() {
        let local = tier();
        local.put("a".to_owned(), CacheEntry::value("1".to_owned())).await;
        let found = local.get_all(&["a".to_owned(), "b".to_owned()]).await;
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("a"));
    }
}
