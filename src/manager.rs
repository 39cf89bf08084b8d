//! Registry of caches sharing one set of collaborators

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::invalidation::{ErrorCallback, NotificationSource};
use crate::membership::{FilterShape, MembershipFilter, TieredFilter};
use crate::redis_tier::{
    RedisBloomFilter, RedisKeyspaceNotifications, RedisLockProvider, RedisSharedTier,
};
use crate::{
    CacheConfig, CacheError, Cacheable, KeyNamespace, LockProvider, SharedTier, TwoTierCache,
};

/// Builds the membership filter for a cache name
pub type FilterFactory = Arc<dyn Fn(&KeyNamespace) -> Arc<dyn MembershipFilter> + Send + Sync>;

/// One [`TwoTierCache`] per cache name, created on first use.
///
/// Caches share the shared tier, lock provider and notification source; each has its own
/// local tier, lock table, filter and reconciliation worker.
pub struct CacheManager<V: Cacheable> {
    config: CacheConfig,
    shared: Arc<dyn SharedTier>,
    lock_provider: Option<Arc<dyn LockProvider>>,
    notifications: Option<Arc<dyn NotificationSource>>,
    filter_factory: Option<FilterFactory>,
    on_error: Option<ErrorCallback>,
    caches: DashMap<String, TwoTierCache<V>>,
}

impl<V: Cacheable> CacheManager<V> {
    pub fn new(config: CacheConfig, shared: Arc<dyn SharedTier>) -> Self {
        Self {
            config,
            shared,
            lock_provider: None,
            notifications: None,
            filter_factory: None,
            on_error: None,
            caches: DashMap::new(),
        }
    }

    /// Manager on Redis, with a shared membership bitmap per cache name
    pub async fn connect(redis_client: redis::Client, config: CacheConfig) -> Result<Self, CacheError> {
        let shared = RedisSharedTier::connect(redis_client.clone()).await?;
        let conn = shared.connection();
        let shape = FilterShape::from_config(&config.membership);
        let filter_conn = conn.clone();
        let notifications = RedisKeyspaceNotifications::new(redis_client);
        if config.enable_invalidation
            && let Err(e) = notifications.enable_on_server().await
        {
            warn!(
                "Could not enable keyspace notifications ({}). Configure notify-keyspace-events on the server.",
                e
            );
        }

        Ok(Self::new(config, Arc::new(shared))
            .with_lock_provider(Arc::new(RedisLockProvider::new(conn)))
            .with_notifications(Arc::new(notifications))
            .with_filter_factory(Arc::new(move |namespace: &KeyNamespace| {
                let shared_filter =
                    RedisBloomFilter::new(filter_conn.clone(), namespace.filter_key(), shape);
                Arc::new(TieredFilter::new(shape, Arc::new(shared_filter))) as Arc<dyn MembershipFilter>
            })))
    }

    pub fn with_lock_provider(mut self, provider: Arc<dyn LockProvider>) -> Self {
        self.lock_provider = Some(provider);
        self
    }

    pub fn with_notifications(mut self, source: Arc<dyn NotificationSource>) -> Self {
        self.notifications = Some(source);
        self
    }

    pub fn with_filter_factory(mut self, factory: FilterFactory) -> Self {
        self.filter_factory = Some(factory);
        self
    }

    pub fn with_error_callback(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    /// The cache for `name`, creating it on first use.
    pub async fn get_cache(&self, name: &str) -> Result<TwoTierCache<V>, CacheError> {
        if let Some(cache) = self.caches.get(name) {
            return Ok(cache.clone());
        }

        let namespace = KeyNamespace::new(&self.config, name)?;
        let mut builder = TwoTierCache::builder(name, self.config.clone(), Arc::clone(&self.shared));
        if let Some(provider) = &self.lock_provider {
            builder = builder.lock_provider(Arc::clone(provider));
        }
        if let Some(source) = &self.notifications {
            builder = builder.notifications(Arc::clone(source));
        }
        if let Some(factory) = &self.filter_factory {
            builder = builder.membership_filter(factory(&namespace));
        }
        if let Some(callback) = &self.on_error {
            builder = builder.on_error(Arc::clone(callback));
        }
        let created = builder.build().await?;

        // Another caller may have created it while we were building; theirs wins
        let cache = self
            .caches
            .entry(name.to_owned())
            .or_insert_with(|| {
                debug!("Registered cache {}", name);
                created
            })
            .clone();
        Ok(cache)
    }

    /// Names of the caches created so far
    pub fn cache_names(&self) -> Vec<String> {
        self.caches.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Unregister `name` and shut its cache down
    pub async fn remove_cache(&self, name: &str) -> bool {
        match self.caches.remove(name) {
            Some((_, cache)) => {
                cache.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Shut every cache down
    pub async fn shutdown(&self) {
        let caches: Vec<TwoTierCache<V>> = self.caches.iter().map(|entry| entry.value().clone()).collect();
        self.caches.clear();
        for cache in caches {
            cache.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryLockProvider, InMemorySharedTier};
    use crate::BoxError;

    fn manager() -> CacheManager<String> {
        let shared = Arc::new(InMemorySharedTier::new());
        CacheManager::new(CacheConfig::default(), Arc::clone(&shared) as Arc<dyn SharedTier>)
            .with_lock_provider(Arc::new(InMemoryLockProvider::new()))
            .with_notifications(shared)
    }

    #[tokio::test]
    async fn test_one_cache_per_name() {
        let manager = manager();
        let a = manager.get_cache("users").await.unwrap();
        a.put("1", "alice".to_owned()).await.unwrap();

        let again = manager.get_cache("users").await.unwrap();
        let value = again
            .get("1", || async { Err::<Option<String>, BoxError>("unused".into()) })
            .await
            .unwrap();
        assert_eq!(value.as_deref().map(String::as_str), Some("alice"));

        manager.get_cache("orders").await.unwrap();
        let mut names = manager.cache_names();
        names.sort();
        assert_eq!(names, vec!["orders".to_owned(), "users".to_owned()]);
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let manager = manager();
        assert!(matches!(
            manager.get_cache("a:b").await,
            Err(CacheError::InvalidConfig(_))
        ));
        assert!(manager.cache_names().is_empty());
    }

    #[tokio::test]
    async fn test_remove_cache() {
        let manager = manager();
        manager.get_cache("users").await.unwrap();
        assert!(manager.remove_cache("users").await);
        assert!(!manager.remove_cache("users").await);
        manager.shutdown().await;
        assert!(manager.cache_names().is_empty());
    }
}
