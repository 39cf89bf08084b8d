//! Write-behind reconciliation
//!
//! Mutations that reach the shared tier asynchronously travel as [`ChangeRecord`]s through a
//! bounded FIFO to a single [`ReconciliationWorker`]. Records carry the already-encoded value,
//! so the worker never needs the value type.
//!
//! The queue lives in memory only. Records still queued when the process dies are lost;
//! [`ReconciliationQueue::flush`] lets a graceful shutdown wait for them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::invalidation::WriteMarks;
use crate::stats::CacheStats;
use crate::{CacheError, SharedTier};

/// Kind of change a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A shared-tier hit was promoted locally; bookkeeping only
    Lookup,
    Add,
    Update,
    Delete,
}

/// One pending shared-tier mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub key: String,
    /// Encoded payload for `Add`/`Update`
    pub value: Option<String>,
    pub ttl: Option<Duration>,
}

impl ChangeRecord {
    pub fn add(key: impl Into<String>, value: String, ttl: Option<Duration>) -> Self {
        Self {
            kind: ChangeKind::Add,
            key: key.into(),
            value: Some(value),
            ttl,
        }
    }

    pub fn update(key: impl Into<String>, value: String, ttl: Option<Duration>) -> Self {
        Self {
            kind: ChangeKind::Update,
            ..Self::add(key, value, ttl)
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            key: key.into(),
            value: None,
            ttl: None,
        }
    }

    pub fn lookup(key: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Lookup,
            ..Self::delete(key)
        }
    }
}

enum QueueItem {
    Record(ChangeRecord),
    Flush(oneshot::Sender<()>),
}

/// Producer side of the reconciliation FIFO
#[derive(Clone)]
pub struct ReconciliationQueue {
    tx: mpsc::Sender<QueueItem>,
}

/// Consumer side, handed to the worker
pub struct QueueReceiver {
    rx: mpsc::Receiver<QueueItem>,
}

impl ReconciliationQueue {
    pub fn new(capacity: usize) -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, QueueReceiver { rx })
    }

    /// Queue a record, waiting for room when the queue is full.
    ///
    /// `Lookup` records are advisory and are discarded instead of waiting.
    pub async fn enqueue(&self, record: ChangeRecord) -> Result<(), CacheError> {
        if record.kind == ChangeKind::Lookup {
            return match self.tx.try_send(QueueItem::Record(record)) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Reconciliation queue full; lookup record discarded");
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(CacheError::QueueClosed),
            };
        }
        self.tx
            .send(QueueItem::Record(record))
            .await
            .map_err(|_| CacheError::QueueClosed)
    }

    /// Wait until every record queued before this call was applied or dropped.
    pub async fn flush(&self) -> Result<(), CacheError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(QueueItem::Flush(done_tx))
            .await
            .map_err(|_| CacheError::QueueClosed)?;
        done_rx.await.map_err(|_| CacheError::QueueClosed)
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Apply one record to the shared tier.
///
/// Idempotent: a set stores the same value again, a delete of a missing key succeeds.
pub async fn apply_record(
    shared: &dyn SharedTier,
    marks: &WriteMarks,
    record: &ChangeRecord,
) -> Result<(), CacheError> {
    match record.kind {
        ChangeKind::Add | ChangeKind::Update => {
            let Some(value) = record.value.as_deref() else {
                warn!("Change record for {} has no value; skipped", record.key);
                return Ok(());
            };
            marks.mark(&record.key);
            let result = shared.set(&record.key, value, record.ttl).await;
            if result.is_err() {
                // No event will follow a failed write
                marks.consume(&record.key);
            }
            result
        }
        ChangeKind::Delete => shared.delete(&record.key).await.map(|_| ()),
        ChangeKind::Lookup => Ok(()),
    }
}

/// Drains the queue into the shared tier
pub struct ReconciliationWorker {
    shared: Arc<dyn SharedTier>,
    marks: WriteMarks,
    stats: Arc<CacheStats>,
    max_attempts: u32,
    backoff: Duration,
}

impl ReconciliationWorker {
    pub fn new(
        shared: Arc<dyn SharedTier>,
        marks: WriteMarks,
        stats: Arc<CacheStats>,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            shared,
            marks,
            stats,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run on a background task until `cancel` fires or every producer is gone.
    pub fn spawn(self, receiver: QueueReceiver, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(receiver, cancel))
    }

    async fn run(self, mut receiver: QueueReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = receiver.rx.recv() => match item {
                    Some(item) => self.process(item, self.max_attempts).await,
                    None => {
                        debug!("Reconciliation queue closed; worker exiting");
                        return;
                    }
                }
            }
        }

        // Shutting down: whatever is already queued gets a single attempt
        receiver.rx.close();
        let mut drained = 0usize;
        while let Some(item) = receiver.rx.recv().await {
            self.process(item, 1).await;
            drained += 1;
        }
        debug!("Reconciliation worker stopped after draining {} items", drained);
    }

    async fn process(&self, item: QueueItem, attempts: u32) {
        match item {
            QueueItem::Record(record) => self.apply_with_retry(record, attempts).await,
            QueueItem::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn apply_with_retry(&self, record: ChangeRecord, attempts: u32) {
        if record.kind == ChangeKind::Lookup {
            debug!("Shared hit promoted locally: {}", record.key);
            return;
        }
        let mut attempt = 1;
        loop {
            match apply_record(self.shared.as_ref(), &self.marks, &record).await {
                Ok(()) => {
                    self.stats.record_reconciled();
                    debug!("Reconciled {:?} for key: {}", record.kind, record.key);
                    return;
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "Reconcile {:?} for key {} failed (attempt {}/{}): {}",
                        record.kind, record.key, attempt, attempts, e
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.stats.record_reconcile_drop();
                    error!(
                        "Dropping {:?} for key {} after {} attempts: {}",
                        record.kind, record.key, attempt, e
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySharedTier;

    fn worker(shared: Arc<InMemorySharedTier>, stats: Arc<CacheStats>) -> ReconciliationWorker {
        ReconciliationWorker::new(
            shared,
            WriteMarks::new(Duration::from_secs(10)),
            stats,
            3,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let shared = InMemorySharedTier::new();
        let marks = WriteMarks::new(Duration::from_secs(10));
        let put = ChangeRecord::add("k", "\"v\"".to_owned(), None);
        apply_record(&shared, &marks, &put).await.unwrap();
        apply_record(&shared, &marks, &put).await.unwrap();
        assert_eq!(shared.peek("k").as_deref(), Some("\"v\""));
        assert_eq!(shared.len(), 1);

        let del = ChangeRecord::delete("k");
        apply_record(&shared, &marks, &del).await.unwrap();
        apply_record(&shared, &marks, &del).await.unwrap();
        assert!(shared.peek("k").is_none());
    }

    #[tokio::test]
    async fn test_failed_apply_is_retried() {
        let shared = Arc::new(InMemorySharedTier::new());
        let stats = Arc::new(CacheStats::new());
        let (queue, receiver) = ReconciliationQueue::new(16);
        let cancel = CancellationToken::new();
        let handle = worker(Arc::clone(&shared), Arc::clone(&stats)).spawn(receiver, cancel.clone());

        shared.fail_next(2);
        queue
            .enqueue(ChangeRecord::update("k", "1".to_owned(), None))
            .await
            .unwrap();
        queue.flush().await.unwrap();

        assert_eq!(shared.peek("k").as_deref(), Some("1"));
        let s = stats.snapshot(0);
        assert_eq!(s.reconciled, 1);
        assert_eq!(s.reconcile_drops, 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_record_is_dropped_and_queue_continues() {
        let shared = Arc::new(InMemorySharedTier::new());
        let stats = Arc::new(CacheStats::new());
        let (queue, receiver) = ReconciliationQueue::new(16);
        let cancel = CancellationToken::new();
        let handle = worker(Arc::clone(&shared), Arc::clone(&stats)).spawn(receiver, cancel.clone());

        shared.fail_next(3);
        queue
            .enqueue(ChangeRecord::add("lost", "1".to_owned(), None))
            .await
            .unwrap();
        queue
            .enqueue(ChangeRecord::add("kept", "2".to_owned(), None))
            .await
            .unwrap();
        queue.flush().await.unwrap();

        assert!(shared.peek("lost").is_none());
        assert_eq!(shared.peek("kept").as_deref(), Some("2"));
        let s = stats.snapshot(0);
        assert_eq!(s.reconcile_drops, 1);
        assert_eq!(s.reconciled, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_lookup_records_never_block() {
        let (queue, _receiver) = ReconciliationQueue::new(1);
        queue.enqueue(ChangeRecord::lookup("a")).await.unwrap();
        // Full: discarded rather than waiting on a worker that never runs
        queue.enqueue(ChangeRecord::lookup("b")).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_records() {
        let shared = Arc::new(InMemorySharedTier::new());
        let stats = Arc::new(CacheStats::new());
        let (queue, receiver) = ReconciliationQueue::new(16);
        for i in 0..5 {
            queue
                .enqueue(ChangeRecord::add(format!("k{}", i), i.to_string(), None))
                .await
                .unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        worker(Arc::clone(&shared), stats).spawn(receiver, cancel).await.unwrap();

        assert_eq!(shared.len(), 5);
        assert!(queue.is_closed());
        assert!(matches!(
            queue.enqueue(ChangeRecord::delete("k0")).await,
            Err(CacheError::QueueClosed)
        ));
    }
}
