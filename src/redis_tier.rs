//! Redis-backed collaborators
//!
//! - [`RedisSharedTier`]: string values, one `ConnectionManager` shared by every call
//! - [`RedisLockProvider`]: `SET NX PX` leases released by token compare-and-delete
//! - [`RedisKeyspaceNotifications`]: keyspace events over pub/sub
//! - [`RedisBloomFilter`]: membership bitmap shared by every process

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use crate::invalidation::{Notification, NotificationSource, NotificationStream};
use crate::membership::{FilterShape, MembershipFilter};
use crate::{CacheError, Lease, LockProvider, SharedOp, SharedTier, escape_glob};

/// Keys per `SCAN` page
const SCAN_COUNT: usize = 500;
/// Keys per `DEL` when deleting in bulk
const DELETE_CHUNK: usize = 500;

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Shared tier on a Redis connection manager
#[derive(Clone)]
pub struct RedisSharedTier {
    conn: ConnectionManager,
}

impl RedisSharedTier {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(client: redis::Client) -> Result<Self, CacheError> {
        Ok(Self::new(ConnectionManager::new(client).await?))
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl SharedTier for RedisSharedTier {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let stored: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(stored.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_all(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let mut removed = 0u64;
        for chunk in keys.chunks(DELETE_CHUNK) {
            let n: u64 = conn.del(chunk).await?;
            removed += n;
        }
        Ok(removed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(prefix));
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn apply_batch(&self, ops: Vec<SharedOp>) -> Result<(), CacheError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                SharedOp::Set {
                    key,
                    value,
                    ttl: Some(ttl),
                } => {
                    pipe.pset_ex(key, value, ttl_millis(*ttl)).ignore();
                }
                SharedOp::Set {
                    key,
                    value,
                    ttl: None,
                } => {
                    pipe.set(key, value).ignore();
                }
                SharedOp::Delete { key } => {
                    pipe.del(key).ignore();
                }
            }
        }
        let mut conn = self.conn.clone();
        let () = pipe.query_async(&mut conn).await?;
        debug!("Applied batch of {} shared operations", ops.len());
        Ok(())
    }
}

static RELEASE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        ",
    )
});

/// Poll interval while waiting for a held lease
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// Lease provider on Redis `SET NX PX`
#[derive(Clone)]
pub struct RedisLockProvider {
    conn: ConnectionManager,
}

impl RedisLockProvider {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn try_acquire(&self, key: &str, lease_timeout: Duration) -> Result<Option<Lease>, CacheError> {
        let mut conn = self.conn.clone();
        let lease = Lease::new(key);
        let granted: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(lease_timeout))
            .query_async(&mut conn)
            .await?;
        Ok(granted.map(|_| lease))
    }
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    async fn acquire(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_timeout: Duration,
    ) -> Result<Option<Lease>, CacheError> {
        let deadline = tokio::time::Instant::now() + wait_timeout;
        loop {
            if let Some(lease) = self.try_acquire(key, lease_timeout).await? {
                return Ok(Some(lease));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(LOCK_RETRY)).await;
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = RELEASE_SCRIPT
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        if removed == 0 {
            debug!("Lease on {} had already expired or changed hands", lease.key);
        }
        Ok(())
    }
}

/// Keyspace notification flags needed by the invalidation listener:
/// keyspace channel, string and generic commands, expired and evicted keys.
const REQUIRED_KEYSPACE_FLAGS: &str = "K$gxe";

/// Redis keyspace notifications (`__keyspace@<db>__:<key>` channels)
#[derive(Clone)]
pub struct RedisKeyspaceNotifications {
    client: redis::Client,
    db: i64,
}

impl RedisKeyspaceNotifications {
    /// Subscribe on the database `client` is configured for
    pub fn new(client: redis::Client) -> Self {
        let db = client.get_connection_info().redis.db;
        Self { client, db }
    }

    fn channel_prefix(&self) -> String {
        keyspace_channel_prefix(self.db)
    }

    /// Add the flags the listener needs to the server's `notify-keyspace-events`, keeping
    /// any flags already set.
    pub async fn enable_on_server(&self) -> Result<(), CacheError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let current: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg("notify-keyspace-events")
            .query_async(&mut conn)
            .await?;
        let current = current.get(1).cloned().unwrap_or_default();
        let merged = merge_keyspace_flags(&current, REQUIRED_KEYSPACE_FLAGS);
        if merged != current {
            let () = redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg(&merged)
                .query_async(&mut conn)
                .await?;
            info!("notify-keyspace-events set to '{}' (was '{}')", merged, current);
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSource for RedisKeyspaceNotifications {
    async fn subscribe(&self, pattern: &str) -> Result<NotificationStream, CacheError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        let prefix = self.channel_prefix();
        pubsub.psubscribe(format!("{}{}", prefix, pattern)).await?;

        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let notification = match msg.get_payload::<String>() {
                Ok(event) => parse_keyspace_message(&prefix, msg.get_channel_name(), event),
                Err(e) => {
                    warn!("Unreadable keyspace event on {}: {}", msg.get_channel_name(), e);
                    None
                }
            };
            futures::future::ready(notification)
        });
        Ok(stream.boxed())
    }
}

fn keyspace_channel_prefix(db: i64) -> String {
    format!("__keyspace@{}__:", db)
}

/// Keyspace channels carry the key in the channel name and the event in the payload.
fn parse_keyspace_message(prefix: &str, channel: &str, event: String) -> Option<Notification> {
    channel
        .strip_prefix(prefix)
        .map(|key| Notification::new(key, event))
}

/// Union of two `notify-keyspace-events` flag sets. `A` already covers `$gxe`.
fn merge_keyspace_flags(current: &str, required: &str) -> String {
    let mut merged = current.to_owned();
    for flag in required.chars() {
        let covered = merged.contains(flag) || (merged.contains('A') && "$gxe".contains(flag));
        if !covered {
            merged.push(flag);
        }
    }
    merged
}

static FILTER_ADD_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        for i = 1, #ARGV do
            redis.call('SETBIT', KEYS[1], ARGV[i], 1)
        end
        return 1
        ",
    )
});

static FILTER_CHECK_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        for i = 1, #ARGV do
            if redis.call('GETBIT', KEYS[1], ARGV[i]) == 0 then
                return 0
            end
        end
        return 1
        ",
    )
});

/// Bloom filter stored as a Redis bitmap under one key
#[derive(Clone)]
pub struct RedisBloomFilter {
    conn: ConnectionManager,
    key: String,
    shape: FilterShape,
}

impl RedisBloomFilter {
    pub fn new(conn: ConnectionManager, key: impl Into<String>, shape: FilterShape) -> Self {
        Self {
            conn,
            key: key.into(),
            shape,
        }
    }
}

#[async_trait]
impl MembershipFilter for RedisBloomFilter {
    async fn add(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let positions: Vec<u64> = self.shape.positions(key).collect();
        let _: i64 = FILTER_ADD_SCRIPT
            .key(&self.key)
            .arg(positions)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let positions: Vec<u64> = self.shape.positions(key).collect();
        let present: i64 = FILTER_CHECK_SCRIPT
            .key(&self.key)
            .arg(positions)
            .invoke_async(&mut conn)
            .await?;
        Ok(present == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keyspace_message() {
        let prefix = keyspace_channel_prefix(2);
        assert_eq!(prefix, "__keyspace@2__:");
        assert_eq!(
            parse_keyspace_message(&prefix, "__keyspace@2__:app:cache:users:1", "del".to_owned()),
            Some(Notification::new("app:cache:users:1", "del"))
        );
        // Keys may contain the channel separator
        assert_eq!(
            parse_keyspace_message(&prefix, "__keyspace@2__:a:b:c", "set".to_owned()),
            Some(Notification::new("a:b:c", "set"))
        );
        assert_eq!(
            parse_keyspace_message(&prefix, "__keyspace@0__:a", "set".to_owned()),
            None
        );
    }

    #[test]
    fn test_merge_keyspace_flags() {
        assert_eq!(merge_keyspace_flags("", "K$gxe"), "K$gxe");
        assert_eq!(merge_keyspace_flags("Ex", "K$gxe"), "ExK$ge");
        assert_eq!(merge_keyspace_flags("AK", "K$gxe"), "AK");
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
