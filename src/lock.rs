//! Stampede protection
//!
//! A load on a local miss runs under a [`LoadPermit`]:
//! - an in-process lock per key, claimed or joined atomically through a concurrent map, so two
//!   first-time callers in one process can never both believe they are alone;
//! - with [`LockStrategy::Distributed`], a cross-process lease from a [`LockProvider`] taken
//!   while holding the in-process lock.
//!
//! Both are released on every exit path. The lease is released explicitly on the normal path
//! and from `Drop` (on a spawned task) if the permit is dropped early.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::{CacheConfig, CacheError, LockStrategy};

/// A granted cross-process lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    /// Identifies the holder; release only succeeds with the matching token
    pub token: String,
}

impl Lease {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Distributed lock provider
#[async_trait]
pub trait LockProvider: Send + Sync + 'static {
    /// Try to take the lease on `key` for `lease_timeout`, waiting up to `wait_timeout`.
    ///
    /// `Ok(None)` means the wait budget ran out.
    async fn acquire(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_timeout: Duration,
    ) -> Result<Option<Lease>, CacheError>;

    /// Give the lease back. Releasing a lease that already expired is not an error.
    async fn release(&self, lease: &Lease) -> Result<(), CacheError>;
}

/// Per-key in-process locks
#[derive(Clone, Default)]
pub struct KeyLocks {
    table: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `key`, or join the callers already queued on it.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let slot = Arc::clone(
            self.table
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = slot.lock_owned().await;
        KeyGuard {
            key: key.to_owned(),
            table: Arc::clone(&self.table),
            guard: Some(guard),
        }
    }

    /// Whether some caller currently holds `key`
    pub fn is_locked(&self, key: &str) -> bool {
        self.table
            .get(key)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Number of keys with a holder or waiters
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Holds one key of a [`KeyLocks`] table; the slot is removed when nobody else waits on it.
pub struct KeyGuard {
    key: String,
    table: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Unlock first so the guard's clone of the slot no longer counts
        drop(self.guard.take());
        self.table
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

struct LeaseGuard {
    provider: Arc<dyn LockProvider>,
    lease: Option<Lease>,
}

impl LeaseGuard {
    async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.provider.release(&lease).await {
                warn!("Failed to release lease on {}: {}. It expires on its own.", lease.key, e);
            }
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        // Dropped without release(): a panic or a cancelled future
        if let Some(lease) = self.lease.take() {
            let provider = Arc::clone(&self.provider);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = provider.release(&lease).await {
                        warn!("Failed to release abandoned lease on {}: {}", lease.key, e);
                    }
                });
            } else {
                warn!("No runtime to release lease on {}; it expires on its own", lease.key);
            }
        }
    }
}

/// Everything held while one key is loaded
pub struct LoadPermit {
    lease: Option<LeaseGuard>,
    _local: KeyGuard,
}

impl LoadPermit {
    /// Whether the cross-process lease is held
    pub fn has_lease(&self) -> bool {
        self.lease.is_some()
    }

    /// Release the lease, then the in-process lock.
    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
    }
}

/// Grants [`LoadPermit`]s
pub struct LockCoordinator {
    locks: KeyLocks,
    provider: Option<Arc<dyn LockProvider>>,
    strategy: LockStrategy,
    wait_timeout: Duration,
    lease_timeout: Duration,
}

impl LockCoordinator {
    pub fn new(config: &CacheConfig, provider: Option<Arc<dyn LockProvider>>) -> Self {
        let strategy = match (config.lock_strategy, &provider) {
            (LockStrategy::Distributed, None) => {
                warn!("Distributed lock strategy requested without a lock provider; using in-process locks only");
                LockStrategy::Local
            }
            (strategy, _) => strategy,
        };
        Self {
            locks: KeyLocks::new(),
            provider,
            strategy,
            wait_timeout: config.lock_wait_timeout,
            lease_timeout: config.lock_lease_timeout,
        }
    }

    pub fn strategy(&self) -> LockStrategy {
        self.strategy
    }

    pub fn key_locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Take the permit for `cache_key`; `lock_key` names its cross-process lease.
    pub async fn acquire(&self, cache_key: &str, lock_key: &str) -> Result<LoadPermit, CacheError> {
        let local = self.lock_local(cache_key).await;
        self.lease(local, cache_key, lock_key).await
    }

    /// First half of [`acquire`](Self::acquire): the in-process lock only.
    ///
    /// Callers that queued behind another loader can re-check the local tier here and skip
    /// the lease entirely.
    pub async fn lock_local(&self, cache_key: &str) -> KeyGuard {
        self.locks.lock(cache_key).await
    }

    /// Second half of [`acquire`](Self::acquire): add the cross-process lease to `local`.
    pub async fn lease(
        &self,
        local: KeyGuard,
        cache_key: &str,
        lock_key: &str,
    ) -> Result<LoadPermit, CacheError> {
        let provider = match (self.strategy, &self.provider) {
            (LockStrategy::Distributed, Some(provider)) => provider,
            _ => {
                return Ok(LoadPermit {
                    lease: None,
                    _local: local,
                });
            }
        };

        match provider
            .acquire(lock_key, self.wait_timeout, self.lease_timeout)
            .await
        {
            Ok(Some(lease)) => {
                debug!("Lease acquired for key: {}", cache_key);
                Ok(LoadPermit {
                    lease: Some(LeaseGuard {
                        provider: Arc::clone(provider),
                        lease: Some(lease),
                    }),
                    _local: local,
                })
            }
            Ok(None) => Err(CacheError::LockTimeout {
                key: cache_key.to_owned(),
                waited: self.wait_timeout,
            }),
            Err(e) => {
                // Provider unreachable: keep the in-process guarantee and carry on
                warn!(
                    "Lock provider error for key {} ({}). Loading under the in-process lock only.",
                    cache_key, e
                );
                Ok(LoadPermit {
                    lease: None,
                    _local: local,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLockProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_claim_or_join_serializes_holders() {
        let locks = KeyLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("cold-key").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty(), "slots are removed once nobody waits");
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
        assert!(locks.is_locked("a"));
    }

    #[tokio::test]
    async fn test_lease_timeout_is_reported() {
        let provider = Arc::new(InMemoryLockProvider::new());
        let config = CacheConfig {
            lock_wait_timeout: Duration::from_millis(50),
            ..CacheConfig::default()
        };
        let coordinator = LockCoordinator::new(&config, Some(provider.clone() as Arc<dyn LockProvider>));

        // Another process holds the lease
        let foreign = provider
            .acquire("lock:k", Duration::ZERO, Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        let err = coordinator.acquire("k", "lock:k").await.err().unwrap();
        assert!(matches!(err, CacheError::LockTimeout { .. }));
        assert!(err.is_retryable());
        // The in-process slot was not leaked
        assert!(coordinator.key_locks().is_empty());

        provider.release(&foreign).await.unwrap();
        let permit = coordinator.acquire("k", "lock:k").await.unwrap();
        assert!(permit.has_lease());
        permit.release().await;
        assert!(!provider.is_held("lock:k"));
    }

    #[tokio::test]
    async fn test_dropped_permit_releases_lease() {
        let provider = Arc::new(InMemoryLockProvider::new());
        let coordinator = LockCoordinator::new(
            &CacheConfig::default(),
            Some(provider.clone() as Arc<dyn LockProvider>),
        );
        let permit = coordinator.acquire("k", "lock:k").await.unwrap();
        assert!(provider.is_held("lock:k"));
        drop(permit);

        for _ in 0..50 {
            if !provider.is_held("lock:k") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("lease was not released after the permit was dropped");
    }

    #[tokio::test]
    async fn test_provider_error_falls_back_to_local_lock() {
        let provider = Arc::new(InMemoryLockProvider::new());
        provider.set_offline(true);
        let coordinator = LockCoordinator::new(
            &CacheConfig::default(),
            Some(provider.clone() as Arc<dyn LockProvider>),
        );
        assert_eq!(coordinator.strategy(), LockStrategy::Distributed);

        let permit = coordinator.acquire("k", "lock:k").await.unwrap();
        assert!(!permit.has_lease());
        assert!(coordinator.key_locks().is_locked("k"));
        permit.release().await;
        assert!(coordinator.key_locks().is_empty());
    }

    #[tokio::test]
    async fn test_lock_local_then_lease() {
        let provider = Arc::new(InMemoryLockProvider::new());
        let coordinator = LockCoordinator::new(
            &CacheConfig::default(),
            Some(provider.clone() as Arc<dyn LockProvider>),
        );
        let local = coordinator.lock_local("k").await;
        assert!(coordinator.key_locks().is_locked("k"));
        assert!(!provider.is_held("lock:k"));

        let permit = coordinator.lease(local, "k", "lock:k").await.unwrap();
        assert!(permit.has_lease());
        assert!(provider.is_held("lock:k"));
        permit.release().await;
        assert!(!provider.is_held("lock:k"));
    }

    #[tokio::test]
    async fn test_local_strategy_without_provider() {
        let config = CacheConfig {
            lock_strategy: LockStrategy::Local,
            ..CacheConfig::default()
        };
        let coordinator = LockCoordinator::new(&config, None);
        let permit = coordinator.acquire("k", "lock:k").await.unwrap();
        assert!(!permit.has_lease());
        assert!(coordinator.key_locks().is_locked("k"));
        permit.release().await;
        assert!(!coordinator.key_locks().is_locked("k"));
    }
}
