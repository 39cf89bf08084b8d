//! In-process collaborators
//!
//! [`InMemorySharedTier`] and [`InMemoryLockProvider`] stand in for Redis in tests and in
//! single-process deployments. The shared tier publishes the same key events Redis keyspace
//! notifications would (`set`, `del`, `expired`) and can be told to fail, so degraded paths
//! can be exercised without a server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Notify, broadcast};
use tracing::warn;

use crate::invalidation::{Notification, NotificationSource, NotificationStream};
use crate::{CacheError, Lease, LockProvider, SharedOp, SharedTier};

struct Stored {
    value: String,
    expires_at: Option<Instant>,
}

impl Stored {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_owned(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }
}

/// Shared tier held in a process-local map
pub struct InMemorySharedTier {
    entries: Mutex<HashMap<String, Stored>>,
    events: broadcast::Sender<Notification>,
    fail_next: AtomicU32,
    offline: AtomicBool,
    operations: AtomicU64,
}

impl Default for InMemorySharedTier {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySharedTier {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
            fail_next: AtomicU32::new(0),
            offline: AtomicBool::new(false),
            operations: AtomicU64::new(0),
        }
    }

    /// Make the next `n` operations fail with [`CacheError::Unavailable`]
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every operation until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Operations attempted through [`SharedTier`], failed ones included
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Publish an arbitrary event to subscribers
    pub fn publish(&self, notification: Notification) {
        // No subscribers is fine
        let _ = self.events.send(notification);
    }

    /// Stored value, bypassing failure injection and the operation count
    pub fn peek(&self, key: &str) -> Option<String> {
        let mut entries = self.lock_entries();
        self.purge_expired(&mut entries);
        entries.get(key).map(|stored| stored.value.clone())
    }

    pub fn len(&self) -> usize {
        let mut entries = self.lock_entries();
        self.purge_expired(&mut entries);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Stored>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call, apply failure injection, then lock the map with expired keys removed.
    fn begin(&self) -> Result<MutexGuard<'_, HashMap<String, Stored>>, CacheError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("shared tier offline".to_owned()));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CacheError::Unavailable("injected shared tier failure".to_owned()));
        }
        let mut entries = self.lock_entries();
        self.purge_expired(&mut entries);
        Ok(entries)
    }

    fn purge_expired(&self, entries: &mut HashMap<String, Stored>) {
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, stored)| stored.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            entries.remove(&key);
            self.publish(Notification::new(key, "expired"));
        }
    }

    fn store(&self, entries: &mut HashMap<String, Stored>, key: &str, value: &str, ttl: Option<Duration>) {
        entries.insert(key.to_owned(), Stored::new(value, ttl));
        self.publish(Notification::new(key, "set"));
    }

    fn remove(&self, entries: &mut HashMap<String, Stored>, key: &str) -> bool {
        let existed = entries.remove(key).is_some();
        if existed {
            self.publish(Notification::new(key, "del"));
        }
        existed
    }
}

#[async_trait]
impl SharedTier for InMemorySharedTier {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.begin()?;
        Ok(entries.get(key).map(|stored| stored.value.clone()))
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let entries = self.begin()?;
        Ok(keys
            .iter()
            .map(|key| entries.get(key).map(|stored| stored.value.clone()))
            .collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut entries = self.begin()?;
        self.store(&mut entries, key, value, ttl);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut entries = self.begin()?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        self.store(&mut entries, key, value, ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut entries = self.begin()?;
        Ok(self.remove(&mut entries, key))
    }

    async fn delete_all(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut entries = self.begin()?;
        Ok(keys
            .iter()
            .filter(|key| self.remove(&mut entries, key))
            .count() as u64)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let entries = self.begin()?;
        Ok(entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn apply_batch(&self, ops: Vec<SharedOp>) -> Result<(), CacheError> {
        let mut entries = self.begin()?;
        for op in ops {
            match op {
                SharedOp::Set { key, value, ttl } => self.store(&mut entries, &key, &value, ttl),
                SharedOp::Delete { key } => {
                    self.remove(&mut entries, &key);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSource for InMemorySharedTier {
    async fn subscribe(&self, pattern: &str) -> Result<NotificationStream, CacheError> {
        let receiver = self.events.subscribe();
        let pattern = pattern.to_owned();
        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(n) if glob_matches(&pattern, &n.key) => return Some((n, receiver)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Notification subscriber lagged; {} events skipped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Match `key` against a glob made of escaped literal text and an optional trailing `*`.
fn glob_matches(pattern: &str, key: &str) -> bool {
    let mut literal = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    literal.push(escaped);
                }
            }
            '*' if chars.as_str().is_empty() => return key.starts_with(literal.as_str()),
            c => literal.push(c),
        }
    }
    key == literal
}

const LOCK_POLL: Duration = Duration::from_millis(10);

/// Lease table held in process memory
pub struct InMemoryLockProvider {
    leases: Mutex<HashMap<String, (String, Instant)>>,
    released: Notify,
    offline: AtomicBool,
}

impl Default for InMemoryLockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            released: Notify::new(),
            offline: AtomicBool::new(false),
        }
    }

    /// Make every call fail until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Whether an unexpired lease exists for `key`
    pub fn is_held(&self, key: &str) -> bool {
        self.lock_leases()
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > Instant::now())
    }

    fn lock_leases(&self) -> MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_take(&self, key: &str, lease_timeout: Duration) -> Option<Lease> {
        let mut leases = self.lock_leases();
        let now = Instant::now();
        if leases.get(key).is_some_and(|(_, expires_at)| *expires_at > now) {
            return None;
        }
        let lease = Lease::new(key);
        leases.insert(key.to_owned(), (lease.token.clone(), now + lease_timeout));
        Some(lease)
    }

    fn check_online(&self) -> Result<(), CacheError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("lock provider offline".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn acquire(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_timeout: Duration,
    ) -> Result<Option<Lease>, CacheError> {
        self.check_online()?;
        let deadline = Instant::now() + wait_timeout;
        loop {
            if let Some(lease) = self.try_take(key, lease_timeout) {
                return Ok(Some(lease));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // A release wakes us early; the poll covers expiry and missed wakeups
            let _ = tokio::time::timeout((deadline - now).min(LOCK_POLL), self.released.notified()).await;
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), CacheError> {
        self.check_online()?;
        let mut leases = self.lock_leases();
        if leases
            .get(&lease.key)
            .is_some_and(|(token, _)| *token == lease.token)
        {
            leases.remove(&lease.key);
            drop(leases);
            self.released.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ttl_expiry_publishes_expired() {
        let tier = InMemorySharedTier::new();
        let mut events = tier.subscribe("*").await.unwrap();
        tier.set("k", "1", Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(events.next().await, Some(Notification::new("k", "set")));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(tier.get("k").await.unwrap(), None);
        assert_eq!(events.next().await, Some(Notification::new("k", "expired")));
    }

    #[tokio::test]
    async fn test_set_if_absent_and_batch() {
        let tier = InMemorySharedTier::new();
        assert!(tier.set_if_absent("k", "1", None).await.unwrap());
        assert!(!tier.set_if_absent("k", "2", None).await.unwrap());
        assert_eq!(tier.peek("k").as_deref(), Some("1"));

        tier.apply_batch(vec![
            SharedOp::Set {
                key: "a".to_owned(),
                value: "x".to_owned(),
                ttl: None,
            },
            SharedOp::Delete { key: "k".to_owned() },
        ])
        .await
        .unwrap();
        assert_eq!(
            tier.multi_get(&["a".to_owned(), "k".to_owned()]).await.unwrap(),
            vec![Some("x".to_owned()), None]
        );
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let tier = InMemorySharedTier::new();
        tier.fail_next(1);
        assert!(tier.set("k", "1", None).await.is_err());
        assert!(tier.set("k", "1", None).await.is_ok());
        tier.set_offline(true);
        assert!(matches!(tier.get("k").await, Err(CacheError::Unavailable(_))));
        assert_eq!(tier.operations(), 3);
    }

    #[test]
    fn test_glob_matching() {
        assert!(glob_matches("app:cache:users:*", "app:cache:users:1"));
        assert!(!glob_matches("app:cache:users:*", "app:cache:orders:1"));
        assert!(glob_matches("svc\\[1\\]:*", "svc[1]:x"));
        assert!(glob_matches("exact", "exact"));
        assert!(!glob_matches("exact", "exactly"));
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_released() {
        let locks = InMemoryLockProvider::new();
        let lease = locks
            .acquire("k", Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(
            locks
                .acquire("k", Duration::from_millis(20), Duration::from_secs(5))
                .await
                .unwrap()
                .is_none()
        );

        // A stale token cannot release someone else's lease
        locks.release(&Lease::new("k")).await.unwrap();
        assert!(locks.is_held("k"));

        locks.release(&lease).await.unwrap();
        assert!(!locks.is_held("k"));
    }

    #[tokio::test]
    async fn test_waiter_gets_lease_after_expiry() {
        let locks = InMemoryLockProvider::new();
        locks
            .acquire("k", Duration::ZERO, Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        let second = locks
            .acquire("k", Duration::from_millis(500), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(second.is_some());
    }
}
