//! Two-tier read-through cache
//!
//! Reads go filter → local tier → (under the load permit) local again → shared tier → loader.
//! Writes land in the local tier immediately and reach the shared tier through the
//! reconciliation queue, or directly in write-through mode. Shared-tier key events evict
//! stale local entries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::invalidation::{
    ErrorCallback, InvalidationListener, NotificationSource, WriteMarks, log_error_callback,
};
use crate::memory::{InMemoryLockProvider, InMemorySharedTier};
use crate::membership::{BloomFilter, FilterShape, MembershipFilter, TieredFilter};
use crate::reconcile::{ChangeRecord, ReconciliationQueue, ReconciliationWorker, apply_record};
use crate::redis_tier::{
    RedisBloomFilter, RedisKeyspaceNotifications, RedisLockProvider, RedisSharedTier,
};
use crate::stats::{CacheStats, StatsMonitor, StatsSnapshot};
use crate::{
    BoxError, CacheConfig, CacheEntry, CacheError, Cacheable, KeyNamespace, LocalTier,
    LockCoordinator, LockProvider, MokaLocalTier, SharedOp, SharedTier, WriteMode,
};

/// Read/write operations on one cache name
#[async_trait]
pub trait Cache<V: Cacheable>: Send + Sync {
    /// Cached value for `key`, loading it with `loader` on a miss.
    async fn get<F, Fut, E>(&self, key: &str, loader: F) -> Result<Option<Arc<V>>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static;

    /// Cached value for `key` without loading
    async fn lookup(&self, key: &str) -> Result<Option<Arc<V>>, CacheError>;

    async fn put(&self, key: &str, value: V) -> Result<(), CacheError>;

    /// Store `value` unless a value is already cached; returns the existing value.
    async fn put_if_absent(&self, key: &str, value: V) -> Result<Option<Arc<V>>, CacheError>;

    async fn evict(&self, key: &str) -> Result<(), CacheError>;

    async fn evict_if_present(&self, key: &str) -> Result<bool, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    /// [`clear`](Self::clear), reporting whether the shared tier held any entry.
    async fn invalidate(&self) -> Result<bool, CacheError>;
}

/// Multi-key operations
#[async_trait]
pub trait BatchCache<V: Cacheable>: Cache<V> {
    async fn batch_get(&self, keys: &[String]) -> Result<HashMap<String, Arc<V>>, CacheError>;

    async fn batch_put(&self, entries: HashMap<String, V>) -> Result<(), CacheError>;

    async fn batch_evict(&self, keys: &[String]) -> Result<(), CacheError>;
}

/// Coordinator for one cache name. Cheap to clone; clones share all state.
pub struct TwoTierCache<V: Cacheable> {
    inner: Arc<Inner<V>>,
}

impl<V: Cacheable> Clone for TwoTierCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<V: Cacheable> {
    namespace: KeyNamespace,
    config: CacheConfig,
    local: Arc<dyn LocalTier<V>>,
    shared: Arc<dyn SharedTier>,
    filter: Option<Arc<dyn MembershipFilter>>,
    locks: LockCoordinator,
    queue: ReconciliationQueue,
    marks: WriteMarks,
    stats: Arc<CacheStats>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<V: Cacheable> Drop for Inner<V> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Assembles a [`TwoTierCache`] from its collaborators
pub struct TwoTierCacheBuilder<V: Cacheable> {
    name: String,
    config: CacheConfig,
    shared: Arc<dyn SharedTier>,
    local: Option<Arc<dyn LocalTier<V>>>,
    lock_provider: Option<Arc<dyn LockProvider>>,
    notifications: Option<Arc<dyn NotificationSource>>,
    filter: Option<Arc<dyn MembershipFilter>>,
    on_error: Option<ErrorCallback>,
}

impl<V: Cacheable> TwoTierCacheBuilder<V> {
    /// Local tier to use instead of a [`MokaLocalTier`] sized from the config
    pub fn local_tier(mut self, local: Arc<dyn LocalTier<V>>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn lock_provider(mut self, provider: Arc<dyn LockProvider>) -> Self {
        self.lock_provider = Some(provider);
        self
    }

    /// Source of shared-tier key events; without one local entries only expire by TTL
    pub fn notifications(mut self, source: Arc<dyn NotificationSource>) -> Self {
        self.notifications = Some(source);
        self
    }

    /// Filter to use instead of an in-process [`BloomFilter`]. Ignored when the membership
    /// filter is disabled in the config.
    pub fn membership_filter(mut self, filter: Arc<dyn MembershipFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Receives invalidation errors such as unknown key events
    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    /// Validate the config and start the background worker and listener.
    pub async fn build(self) -> Result<TwoTierCache<V>, CacheError> {
        let Self {
            name,
            config,
            shared,
            local,
            lock_provider,
            notifications,
            filter,
            on_error,
        } = self;
        config.validate()?;
        let namespace = KeyNamespace::new(&config, &name)?;

        let local =
            local.unwrap_or_else(|| Arc::new(MokaLocalTier::new(&config)) as Arc<dyn LocalTier<V>>);
        let filter = config.membership.enabled.then(|| {
            filter.unwrap_or_else(|| {
                Arc::new(BloomFilter::from_config(&config.membership)) as Arc<dyn MembershipFilter>
            })
        });
        let locks = LockCoordinator::new(&config, lock_provider);
        let marks = WriteMarks::new(config.self_write_window);
        let stats = Arc::new(CacheStats::new());
        let cancel = CancellationToken::new();

        let (queue, receiver) = ReconciliationQueue::new(config.queue_capacity);
        let mut tasks = vec![
            ReconciliationWorker::new(
                Arc::clone(&shared),
                marks.clone(),
                Arc::clone(&stats),
                config.max_apply_attempts,
                config.apply_retry_backoff,
            )
            .spawn(receiver, cancel.clone()),
        ];

        match (config.enable_invalidation, notifications) {
            (true, Some(source)) => {
                let listener = InvalidationListener::new(
                    namespace.clone(),
                    Arc::clone(&local),
                    marks.clone(),
                    on_error.unwrap_or_else(log_error_callback),
                );
                tasks.push(listener.start(source, cancel.clone()).await);
            }
            (true, None) => {
                debug!(
                    "No notification source for cache {}; local entries expire by TTL only",
                    name
                );
            }
            (false, _) => {}
        }

        info!(
            "Cache {} ready (prefix {}, {:?}, {:?})",
            name,
            namespace.prefix(),
            locks.strategy(),
            config.write_mode
        );

        Ok(TwoTierCache {
            inner: Arc::new(Inner {
                namespace,
                config,
                local,
                shared,
                filter,
                locks,
                queue,
                marks,
                stats,
                cancel,
                tasks: Mutex::new(tasks),
            }),
        })
    }
}

impl<V: Cacheable> TwoTierCache<V> {
    pub fn builder(
        name: impl Into<String>,
        config: CacheConfig,
        shared: Arc<dyn SharedTier>,
    ) -> TwoTierCacheBuilder<V> {
        TwoTierCacheBuilder {
            name: name.into(),
            config,
            shared,
            local: None,
            lock_provider: None,
            notifications: None,
            filter: None,
            on_error: None,
        }
    }

    /// Create a cache on Redis: shared tier, leases, keyspace notifications and a
    /// membership bitmap shared by every process.
    pub async fn new(
        redis_client: redis::Client,
        name: &str,
        config: CacheConfig,
    ) -> Result<Self, CacheError> {
        let namespace = KeyNamespace::new(&config, name)?;
        let shared = RedisSharedTier::connect(redis_client.clone()).await?;
        let conn = shared.connection();

        let mut builder = Self::builder(name, config.clone(), Arc::new(shared))
            .lock_provider(Arc::new(RedisLockProvider::new(conn.clone())));

        if config.enable_invalidation {
            let notifications = RedisKeyspaceNotifications::new(redis_client);
            // Best effort: managed servers often disallow CONFIG
            if let Err(e) = notifications.enable_on_server().await {
                warn!(
                    "Could not enable keyspace notifications ({}). Configure notify-keyspace-events on the server.",
                    e
                );
            }
            builder = builder.notifications(Arc::new(notifications));
        }

        if config.membership.enabled {
            let shape = FilterShape::from_config(&config.membership);
            let shared_filter = Arc::new(RedisBloomFilter::new(conn, namespace.filter_key(), shape));
            builder = builder.membership_filter(Arc::new(TieredFilter::new(shape, shared_filter)));
        }

        builder.build().await
    }

    /// Create a cache whose shared tier lives in this process
    pub async fn in_memory(name: &str, config: CacheConfig) -> Result<Self, CacheError> {
        let shared = Arc::new(InMemorySharedTier::new());
        Self::builder(name, config, Arc::clone(&shared) as Arc<dyn SharedTier>)
            .lock_provider(Arc::new(InMemoryLockProvider::new()))
            .notifications(shared)
            .build()
            .await
    }

    pub fn name(&self) -> &str {
        self.inner.namespace.cache_name()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Full key under which `raw_key` is stored in both tiers
    pub fn cache_key(&self, raw_key: &str) -> String {
        self.inner.namespace.cache_key(raw_key)
    }

    /// Get value by key, loading it on a miss.
    ///
    /// A key the membership filter has never seen is reported absent without touching either
    /// tier. On a local miss the load runs on its own task under the key's load permit, so a
    /// caller that gives up neither leaks the permit nor stops the result from being cached.
    pub async fn get<F, Fut, E>(&self, key: &str, loader: F) -> Result<Option<Arc<V>>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let cache_key = self.cache_key(key);
        if !self.inner.might_contain(&cache_key).await {
            self.inner.stats.record_filter_rejection();
            debug!("Membership filter rejected key: {}", cache_key);
            return Ok(None);
        }

        if let Some(entry) = self.inner.local.get(&cache_key).await {
            self.inner.stats.record_local_hit();
            debug!("Cache hit local for key: {}", cache_key);
            return Ok(entry.into_option());
        }
        debug!("Cache miss local for key: {}", cache_key);

        let inner = Arc::clone(&self.inner);
        let load = tokio::spawn(async move { inner.load_locked(cache_key, loader).await });
        match load.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(CacheError::Unavailable(format!(
                "load task did not complete: {}",
                e
            ))),
        }
    }

    /// Cached value without loading. Shared hits are promoted to the local tier.
    pub async fn lookup(&self, key: &str) -> Result<Option<Arc<V>>, CacheError> {
        let inner = &self.inner;
        let cache_key = self.cache_key(key);
        if !inner.might_contain(&cache_key).await {
            inner.stats.record_filter_rejection();
            return Ok(None);
        }
        if let Some(entry) = inner.local.get(&cache_key).await {
            inner.stats.record_local_hit();
            return Ok(entry.into_option());
        }
        match inner.shared_get(&cache_key).await {
            Some(entry) => {
                inner.stats.record_shared_hit();
                debug!("Cache hit shared for key: {}", cache_key);
                inner.promote(&cache_key, entry.clone()).await;
                Ok(entry.into_option())
            }
            None => {
                inner.stats.record_miss();
                Ok(None)
            }
        }
    }

    /// Store `value`: local tier now, shared tier per the configured [`WriteMode`].
    pub async fn put(&self, key: &str, value: V) -> Result<(), CacheError> {
        let cache_key = self.cache_key(key);
        let existed = self.inner.local.get(&cache_key).await.is_some();
        self.inner
            .store(
                &cache_key,
                CacheEntry::value(value),
                existed,
                self.inner.config.write_mode,
            )
            .await
    }

    /// Store `value` unless a value is already cached, returning the cached one.
    ///
    /// The shared write is a native set-if-absent. A cached absence counts as no value and is
    /// overwritten.
    pub async fn put_if_absent(&self, key: &str, value: V) -> Result<Option<Arc<V>>, CacheError> {
        let inner = &self.inner;
        let cache_key = self.cache_key(key);
        if let Some(CacheEntry::Value(existing)) = inner.local.get(&cache_key).await {
            return Ok(Some(existing));
        }

        let entry = CacheEntry::value(value);
        let payload = entry.encode()?;
        let ttl = inner.config.shared_ttl;

        inner.marks.mark(&cache_key);
        let stored = inner.shared.set_if_absent(&cache_key, &payload, ttl).await;
        if !matches!(stored, Ok(true)) {
            inner.marks.consume(&cache_key);
        }
        match stored {
            Ok(true) => {}
            Ok(false) => {
                let current = inner.shared.get(&cache_key).await?;
                match current.as_deref().map(CacheEntry::<V>::decode) {
                    Some(Ok(CacheEntry::Value(existing))) => {
                        inner
                            .promote(&cache_key, CacheEntry::Value(Arc::clone(&existing)))
                            .await;
                        return Ok(Some(existing));
                    }
                    // Cached absence, corrupt payload, or expired since the SET NX
                    _ => {
                        inner
                            .propagate(
                                ChangeRecord::add(&cache_key, payload, ttl),
                                WriteMode::WriteThrough,
                            )
                            .await?
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Shared SET NX error for key {} ({}). Re-queued as a plain write.",
                    cache_key, e
                );
                inner
                    .queue
                    .enqueue(ChangeRecord::add(&cache_key, payload, ttl))
                    .await?;
            }
        }

        inner.local.put(cache_key.clone(), entry).await;
        inner.remember(&cache_key).await;
        Ok(None)
    }

    /// Remove `key` from both tiers.
    ///
    /// The shared delete is synchronous in either [`WriteMode`]; a queued delete would let the
    /// next read promote the old shared value back into the local tier.
    pub async fn evict(&self, key: &str) -> Result<(), CacheError> {
        let cache_key = self.cache_key(key);
        debug!("Evicting key: {}", cache_key);
        self.inner.remove(&cache_key).await?;
        Ok(())
    }

    /// Remove `key` from both tiers, reporting whether either held it.
    pub async fn evict_if_present(&self, key: &str) -> Result<bool, CacheError> {
        let cache_key = self.cache_key(key);
        self.inner.remove(&cache_key).await
    }

    /// Remove every entry of this cache name from both tiers. Other names are untouched.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.invalidate().await?;
        Ok(())
    }

    /// [`clear`](Self::clear), reporting whether the shared tier held any entry of this name.
    pub async fn invalidate(&self) -> Result<bool, CacheError> {
        let inner = &self.inner;
        inner.local.invalidate_all().await;
        inner.queue.flush().await?;
        let keys = inner.shared.scan_prefix(inner.namespace.prefix()).await?;
        let removed = if keys.is_empty() {
            0
        } else {
            inner.shared.delete_all(&keys).await?
        };
        info!("Cache {} cleared ({} shared keys removed)", self.name(), removed);
        Ok(removed > 0)
    }

    /// Values for `keys` found in either tier, keyed by raw key. Keys found in neither are
    /// omitted; shared hits are promoted to the local tier.
    pub async fn batch_get<K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> Result<HashMap<String, Arc<V>>, CacheError> {
        let inner = &self.inner;
        let cache_keys: Vec<String> = keys.iter().map(|k| self.cache_key(k.as_ref())).collect();
        let local_hits = inner.local.get_all(&cache_keys).await;

        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        for (raw, cache_key) in keys.iter().zip(cache_keys) {
            match local_hits.get(&cache_key) {
                Some(entry) => {
                    inner.stats.record_local_hit();
                    if let CacheEntry::Value(value) = entry {
                        found.insert(raw.as_ref().to_owned(), Arc::clone(value));
                    }
                }
                None => missing.push((raw.as_ref().to_owned(), cache_key)),
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        let missing_keys: Vec<String> = missing.iter().map(|(_, ck)| ck.clone()).collect();
        let payloads = match inner.shared.multi_get(&missing_keys).await {
            Ok(payloads) => payloads,
            Err(e) => {
                warn!(
                    "Shared MGET error for {} keys ({}). Returning local hits only.",
                    missing_keys.len(),
                    e
                );
                missing.iter().for_each(|_| inner.stats.record_miss());
                return Ok(found);
            }
        };

        let mut promoted = HashMap::new();
        for ((raw, cache_key), payload) in missing.into_iter().zip(payloads) {
            let entry = payload.and_then(|p| match CacheEntry::<V>::decode(&p) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Failed to decode shared value for key {}: {}", cache_key, e);
                    None
                }
            });
            match entry {
                Some(entry) => {
                    inner.stats.record_shared_hit();
                    if let CacheEntry::Value(value) = &entry {
                        found.insert(raw, Arc::clone(value));
                    }
                    promoted.insert(cache_key, entry);
                }
                None => inner.stats.record_miss(),
            }
        }
        for cache_key in promoted.keys() {
            inner.remember(cache_key).await;
            inner.note_lookup(cache_key).await;
        }
        debug!("Promoted {} shared hits to the local tier", promoted.len());
        inner.local.put_all(promoted).await;
        Ok(found)
    }

    /// Store all `entries`: local tier first, then one atomic shared batch.
    pub async fn batch_put(&self, entries: HashMap<String, V>) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let inner = &self.inner;
        let ttl = inner.config.shared_ttl;
        let mut local_entries = HashMap::with_capacity(entries.len());
        let mut ops = Vec::with_capacity(entries.len());
        for (raw, value) in entries {
            let cache_key = self.cache_key(&raw);
            let entry = CacheEntry::value(value);
            ops.push(SharedOp::Set {
                key: cache_key.clone(),
                value: entry.encode()?,
                ttl,
            });
            local_entries.insert(cache_key, entry);
        }
        let keys: Vec<String> = local_entries.keys().cloned().collect();
        inner.local.put_all(local_entries).await;

        inner.queue.flush().await?;
        keys.iter().for_each(|key| inner.marks.mark(key));
        if let Err(e) = inner.shared.apply_batch(ops.clone()).await {
            keys.iter().for_each(|key| {
                inner.marks.consume(key);
            });
            warn!(
                "Shared batch write of {} keys failed ({}). Re-queued individually.",
                ops.len(),
                e
            );
            for op in ops {
                if let SharedOp::Set { key, value, ttl } = op {
                    inner.queue.enqueue(ChangeRecord::add(key, value, ttl)).await?;
                }
            }
        }

        for key in &keys {
            inner.remember(key).await;
        }
        Ok(())
    }

    /// Remove all `keys`: local tier first, then one atomic shared batch delete.
    pub async fn batch_evict<K: AsRef<str>>(&self, keys: &[K]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let inner = &self.inner;
        let cache_keys: Vec<String> = keys.iter().map(|k| self.cache_key(k.as_ref())).collect();
        inner.local.invalidate_many(&cache_keys).await;

        inner.queue.flush().await?;
        let ops = cache_keys
            .iter()
            .map(|key| SharedOp::Delete { key: key.clone() })
            .collect();
        if let Err(e) = inner.shared.apply_batch(ops).await {
            warn!(
                "Shared batch delete of {} keys failed ({}). Re-queued individually.",
                cache_keys.len(),
                e
            );
            for key in cache_keys {
                inner.queue.enqueue(ChangeRecord::delete(key)).await?;
            }
        }
        Ok(())
    }

    /// Wait until every shared write queued so far was applied or dropped.
    pub async fn flush(&self) -> Result<(), CacheError> {
        self.inner.queue.flush().await
    }

    /// Apply queued writes, then stop the background worker and listener.
    ///
    /// Write-behind operations fail with [`CacheError::QueueClosed`] afterwards.
    pub async fn shutdown(&self) {
        if self.inner.queue.flush().await.is_err() {
            debug!("Cache {} was already shut down", self.name());
        }
        self.inner.cancel.cancel();
        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task of cache {} ended abnormally: {}", self.name(), e);
            }
        }
        info!("Cache {} shut down", self.name());
    }

    /// Current counters with the local tier size
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.inner.local.entry_count())
    }

    /// A monitor sampling this cache every `interval`; call `start` on it to begin.
    pub fn stats_monitor(&self, interval: Duration) -> StatsMonitor {
        let local = Arc::clone(&self.inner.local);
        StatsMonitor::new(
            self.name(),
            Arc::clone(&self.inner.stats),
            move || local.entry_count(),
            interval,
        )
    }
}

impl<V: Cacheable> Inner<V> {
    /// Filter answer; an erroring filter lets the key through
    async fn might_contain(&self, cache_key: &str) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        filter.contains(cache_key).await.unwrap_or_else(|e| {
            warn!("Membership filter error for key {} ({}). Treating as present.", cache_key, e);
            true
        })
    }

    async fn remember(&self, cache_key: &str) {
        if let Some(filter) = &self.filter
            && let Err(e) = filter.add(cache_key).await
        {
            warn!("Failed to add key {} to membership filter: {}", cache_key, e);
        }
    }

    fn shared_ttl(&self, entry: &CacheEntry<V>) -> Option<Duration> {
        if entry.is_null() {
            Some(self.config.null_ttl)
        } else {
            self.config.shared_ttl
        }
    }

    /// Delete `cache_key` from both tiers, reporting whether either held it.
    ///
    /// Writes already queued are applied first so they cannot bring the key back.
    async fn remove(&self, cache_key: &str) -> Result<bool, CacheError> {
        let local_had = self.local.invalidate(cache_key).await;
        self.queue.flush().await?;
        let shared_had = match self.shared.delete(cache_key).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!(
                    "Shared DEL error for key {} ({}). Re-queued; reporting local presence only.",
                    cache_key, e
                );
                self.queue.enqueue(ChangeRecord::delete(cache_key)).await?;
                false
            }
        };
        // A read between the two deletes may have promoted the old shared value
        self.local.invalidate(cache_key).await;
        Ok(local_had || shared_had)
    }

    /// Shared entry for `cache_key`; unreachable tiers and corrupt payloads read as a miss.
    async fn shared_get(&self, cache_key: &str) -> Option<CacheEntry<V>> {
        let payload = match self.shared.get(cache_key).await {
            Ok(payload) => payload?,
            Err(e) => {
                warn!(
                    "Shared GET error for key {} ({}). Treating as a miss.",
                    cache_key, e
                );
                return None;
            }
        };
        match CacheEntry::decode(&payload) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(
                    "Failed to decode shared value for key {}: {}. Deleting corrupt entry.",
                    cache_key, e
                );
                if let Err(del_err) = self.shared.delete(cache_key).await {
                    warn!("Failed to delete corrupt shared entry {}: {}", cache_key, del_err);
                }
                None
            }
        }
    }

    /// Copy a shared hit into the local tier
    async fn promote(&self, cache_key: &str, entry: CacheEntry<V>) {
        self.local.put(cache_key.to_owned(), entry).await;
        self.remember(cache_key).await;
        self.note_lookup(cache_key).await;
    }

    async fn note_lookup(&self, cache_key: &str) {
        if let Err(e) = self.queue.enqueue(ChangeRecord::lookup(cache_key)).await {
            debug!("Lookup record for {} not queued: {}", cache_key, e);
        }
    }

    /// Write `entry` to the local tier and send it on to the shared tier.
    async fn store(
        &self,
        cache_key: &str,
        entry: CacheEntry<V>,
        existed: bool,
        mode: WriteMode,
    ) -> Result<(), CacheError> {
        let payload = entry.encode()?;
        let ttl = self.shared_ttl(&entry);
        self.local.put(cache_key.to_owned(), entry).await;
        self.remember(cache_key).await;
        let record = if existed {
            ChangeRecord::update(cache_key, payload, ttl)
        } else {
            ChangeRecord::add(cache_key, payload, ttl)
        };
        self.propagate(record, mode).await
    }

    /// Hand a record to the queue, or apply it now and queue it only on failure.
    async fn propagate(&self, record: ChangeRecord, mode: WriteMode) -> Result<(), CacheError> {
        match mode {
            WriteMode::WriteBehind => self.queue.enqueue(record).await,
            WriteMode::WriteThrough => {
                match apply_record(self.shared.as_ref(), &self.marks, &record).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!(
                            "Shared {:?} for key {} failed ({}). Re-queued.",
                            record.kind, record.key, e
                        );
                        self.queue.enqueue(record).await
                    }
                }
            }
        }
    }

    async fn load_locked<F, Fut, E>(
        &self,
        cache_key: String,
        loader: F,
    ) -> Result<Option<Arc<V>>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let local = self.locks.lock_local(&cache_key).await;
        // The caller ahead of us in this process may have loaded it; no lease needed then
        if let Some(entry) = self.local.get(&cache_key).await {
            self.stats.record_local_hit();
            debug!("Cache hit local after wait for key: {}", cache_key);
            return Ok(entry.into_option());
        }

        let lock_key = self.namespace.lock_key(&cache_key);
        let permit = self.locks.lease(local, &cache_key, &lock_key).await?;
        let result = self.load(&cache_key, loader).await;
        permit.release().await;
        result
    }

    async fn load<F, Fut, E>(&self, cache_key: &str, loader: F) -> Result<Option<Arc<V>>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        // A lease holder in another process may have loaded it
        if let Some(entry) = self.shared_get(cache_key).await {
            self.stats.record_shared_hit();
            debug!("Cache hit shared for key: {}", cache_key);
            self.promote(cache_key, entry.clone()).await;
            return Ok(entry.into_option());
        }
        self.stats.record_miss();
        debug!("Cache miss shared for key: {}", cache_key);

        let started = Instant::now();
        let loaded = loader()
            .await
            .map_err(|e| CacheError::load(cache_key, e.into()));
        self.stats.record_load(started.elapsed(), loaded.is_ok());

        let entry = match loaded {
            Ok(Some(value)) => CacheEntry::value(value),
            Ok(None) if self.config.cache_null_values => CacheEntry::Null,
            Ok(None) => {
                debug!("Loader found no value for key {}; not cached", cache_key);
                return Ok(None);
            }
            Err(e) => {
                error!("{}", e);
                return Err(e);
            }
        };

        // Written through while the permit is held, so waiters in other processes find it
        self.store(cache_key, entry.clone(), false, WriteMode::WriteThrough)
            .await?;
        Ok(entry.into_option())
    }
}

#[async_trait]
impl<V: Cacheable> Cache<V> for TwoTierCache<V> {
    async fn get<F, Fut, E>(&self, key: &str, loader: F) -> Result<Option<Arc<V>>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        TwoTierCache::get(self, key, loader).await
    }

    async fn lookup(&self, key: &str) -> Result<Option<Arc<V>>, CacheError> {
        TwoTierCache::lookup(self, key).await
    }

    async fn put(&self, key: &str, value: V) -> Result<(), CacheError> {
        TwoTierCache::put(self, key, value).await
    }

    async fn put_if_absent(&self, key: &str, value: V) -> Result<Option<Arc<V>>, CacheError> {
        TwoTierCache::put_if_absent(self, key, value).await
    }

    async fn evict(&self, key: &str) -> Result<(), CacheError> {
        TwoTierCache::evict(self, key).await
    }

    async fn evict_if_present(&self, key: &str) -> Result<bool, CacheError> {
        TwoTierCache::evict_if_present(self, key).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        TwoTierCache::clear(self).await
    }

    async fn invalidate(&self) -> Result<bool, CacheError> {
        TwoTierCache::invalidate(self).await
    }
}

#[async_trait]
impl<V: Cacheable> BatchCache<V> for TwoTierCache<V> {
    async fn batch_get(&self, keys: &[String]) -> Result<HashMap<String, Arc<V>>, CacheError> {
        TwoTierCache::batch_get(self, keys).await
    }

    async fn batch_put(&self, entries: HashMap<String, V>) -> Result<(), CacheError> {
        TwoTierCache::batch_put(self, entries).await
    }

    async fn batch_evict(&self, keys: &[String]) -> Result<(), CacheError> {
        TwoTierCache::batch_evict(self, keys).await
    }
}
