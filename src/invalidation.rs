//! Shared-tier → local-tier invalidation
//!
//! The shared tier publishes key lifecycle events. The listener turns each event for this
//! cache's prefix into a [`LocalCommand`] and applies it to the local tier. It only ever evicts:
//! the next local read re-fetches from the shared tier, so the listener never needs to know
//! the value's type.
//!
//! Writes this process makes to the shared tier are marked in [`WriteMarks`] first, so the
//! `set` events they cause do not evict the entry that was just populated.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{CacheError, KeyNamespace, LocalTier};

/// One key lifecycle event from the shared tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub key: String,
    /// Event name as published (`set`, `del`, `expired`, ...)
    pub event: String,
}

impl Notification {
    pub fn new(key: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            event: event.into(),
        }
    }
}

pub type NotificationStream = BoxStream<'static, Notification>;

/// Change-notification channel of the shared tier. Delivery is at-least-once.
#[async_trait]
pub trait NotificationSource: Send + Sync + 'static {
    /// Events for keys matching the glob `pattern`. Implementations may deliver more; the
    /// listener filters by prefix.
    async fn subscribe(&self, pattern: &str) -> Result<NotificationStream, CacheError>;
}

/// What happened to a shared key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEventKind {
    /// Value overwritten
    Set,
    Deleted,
    Expired,
    /// Dropped by the store's memory policy
    Evicted,
    RenamedFrom,
    RenamedTo,
    /// TTL added or removed; value unchanged
    TtlChanged,
}

impl KeyEventKind {
    pub fn parse(event: &str) -> Option<Self> {
        match event {
            "set" | "setrange" | "append" | "incrby" | "incrbyfloat" | "restore" | "copy_to"
            | "move_to" => Some(Self::Set),
            "del" | "move_from" => Some(Self::Deleted),
            "expired" => Some(Self::Expired),
            "evicted" => Some(Self::Evicted),
            "rename_from" => Some(Self::RenamedFrom),
            "rename_to" => Some(Self::RenamedTo),
            "expire" | "persist" => Some(Self::TtlChanged),
            _ => None,
        }
    }
}

/// Instruction for the local tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCommand {
    Evict(String),
    Ignore,
}

/// Counts shared writes made by this process whose `set` events have not arrived yet
#[derive(Clone)]
pub struct WriteMarks {
    marks: moka::sync::Cache<String, Arc<AtomicU32>>,
}

impl WriteMarks {
    /// Marks older than `window` are forgotten.
    pub fn new(window: Duration) -> Self {
        Self {
            marks: moka::sync::Cache::builder()
                .max_capacity(100_000)
                .time_to_live(window)
                .build(),
        }
    }

    pub fn mark(&self, key: &str) {
        self.marks
            .get_with(key.to_owned(), || Arc::new(AtomicU32::new(0)))
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Take one mark for `key`, returning whether there was one
    pub fn consume(&self, key: &str) -> bool {
        self.marks.get(key).is_some_and(|count| {
            count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        })
    }
}

/// Receives errors the listener does not treat as fatal
pub type ErrorCallback = Arc<dyn Fn(CacheError) + Send + Sync>;

/// Default callback: log and carry on
pub fn log_error_callback() -> ErrorCallback {
    Arc::new(|e: CacheError| warn!("Invalidation listener error: {}", e))
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_millis(2000);

/// Evicts local entries when the shared tier reports a change
pub struct InvalidationListener<V> {
    namespace: KeyNamespace,
    local: Arc<dyn LocalTier<V>>,
    marks: WriteMarks,
    on_error: ErrorCallback,
}

impl<V: Send + Sync + 'static> InvalidationListener<V> {
    pub fn new(
        namespace: KeyNamespace,
        local: Arc<dyn LocalTier<V>>,
        marks: WriteMarks,
        on_error: ErrorCallback,
    ) -> Self {
        Self {
            namespace,
            local,
            marks,
            on_error,
        }
    }

    /// Translate a notification into a local command.
    pub fn command_for(&self, notification: &Notification) -> Result<LocalCommand, CacheError> {
        if !self.namespace.owns(&notification.key) {
            return Ok(LocalCommand::Ignore);
        }
        let key = notification.key.clone();
        match KeyEventKind::parse(&notification.event) {
            Some(KeyEventKind::Set) => {
                if self.marks.consume(&key) {
                    Ok(LocalCommand::Ignore)
                } else {
                    Ok(LocalCommand::Evict(key))
                }
            }
            Some(
                KeyEventKind::Deleted
                | KeyEventKind::Expired
                | KeyEventKind::Evicted
                | KeyEventKind::RenamedFrom
                | KeyEventKind::RenamedTo,
            ) => Ok(LocalCommand::Evict(key)),
            Some(KeyEventKind::TtlChanged) => Ok(LocalCommand::Ignore),
            None => Err(CacheError::UnknownEvent {
                key,
                event: notification.event.clone(),
            }),
        }
    }

    /// Apply one notification. Unknown events go to the error callback.
    pub async fn handle(&self, notification: Notification) {
        match self.command_for(&notification) {
            Ok(LocalCommand::Evict(key)) => {
                if self.local.invalidate(&key).await {
                    debug!(
                        "Local entry evicted after shared '{}' event: {}",
                        notification.event, key
                    );
                }
            }
            Ok(LocalCommand::Ignore) => {}
            Err(e) => (self.on_error)(e),
        }
    }

    /// Subscribe, then process events on a background task until `cancel` fires.
    ///
    /// The first subscription is made before returning so no event published afterwards is
    /// missed. A failed or ended subscription is retried with exponential backoff.
    pub async fn start(
        self,
        source: Arc<dyn NotificationSource>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pattern = self.namespace.scan_pattern();
        let first = match source.subscribe(&pattern).await {
            Ok(stream) => {
                debug!("Invalidation listener subscribed to {}", pattern);
                Some(stream)
            }
            Err(e) => {
                warn!(
                    "Invalidation listener: initial subscribe to {} failed ({}), will retry",
                    pattern, e
                );
                None
            }
        };
        tokio::spawn(self.run(source, pattern, first, cancel))
    }

    async fn run(
        self,
        source: Arc<dyn NotificationSource>,
        pattern: String,
        mut stream: Option<NotificationStream>,
        cancel: CancellationToken,
    ) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let Some(mut events) = stream.take() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                match source.subscribe(&pattern).await {
                    Ok(s) => {
                        debug!("Invalidation listener resubscribed to {}", pattern);
                        backoff = INITIAL_BACKOFF;
                        stream = Some(s);
                    }
                    Err(e) => {
                        backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
                        warn!(
                            "Invalidation listener: subscribe to {} failed ({}), retrying in {:?}",
                            pattern, e, backoff
                        );
                    }
                }
                continue;
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Invalidation listener for {} stopped", pattern);
                        return;
                    }
                    next = events.next() => match next {
                        Some(notification) => self.handle(notification).await,
                        None => {
                            error!("Invalidation stream for {} ended; reconnecting", pattern);
                            break;
                        }
                    }
                }
            }
        }
    }
}
