//! Hit/miss accounting and periodic reporting

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Monotonic counters for one cache name.
///
/// `requests == hits + misses`; rates are derived in [`StatsSnapshot`].
#[derive(Debug, Default)]
pub struct CacheStats {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    filter_rejections: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    load_nanos: AtomicU64,
    reconciled: AtomicU64,
    reconcile_drops: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_local_hit(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shared_hit(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.shared_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_filter_rejection(&self) {
        self.record_miss();
        self.filter_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self, elapsed: Duration, ok: bool) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.load_nanos.fetch_add(nanos, Ordering::Relaxed);
        if !ok {
            self.load_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_reconciled(&self) {
        self.reconciled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconcile_drop(&self) {
        self.reconcile_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters, with `size` sampled by the caller
    pub fn snapshot(&self, size: u64) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            filter_rejections: self.filter_rejections.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            total_load_time: Duration::from_nanos(self.load_nanos.load(Ordering::Relaxed)),
            reconciled: self.reconciled.load(Ordering::Relaxed),
            reconcile_drops: self.reconcile_drops.load(Ordering::Relaxed),
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub local_hits: u64,
    pub shared_hits: u64,
    pub filter_rejections: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub total_load_time: Duration,
    pub reconciled: u64,
    pub reconcile_drops: u64,
    /// Local entries at sampling time
    pub size: u64,
}

impl StatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.requests as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.misses as f64 / self.requests as f64
        }
    }

    /// Mean loader latency
    pub fn average_load_penalty(&self) -> Duration {
        if self.loads == 0 {
            Duration::ZERO
        } else {
            self.total_load_time / u32::try_from(self.loads).unwrap_or(u32::MAX)
        }
    }
}

/// Destination of periodic samples
pub trait StatsReporter: Send + Sync + 'static {
    fn report(&self, cache_name: &str, snapshot: &StatsSnapshot);
}

/// Logs each sample at `info`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl StatsReporter for TracingReporter {
    fn report(&self, cache_name: &str, s: &StatsSnapshot) {
        info!(
            "Cache {} stats: size={} requests={} hit_rate={:.2}% miss_rate={:.2}% local_hits={} shared_hits={} filtered={} loads={} load_failures={} avg_load={:?} reconciled={} dropped={}",
            cache_name,
            s.size,
            s.requests,
            s.hit_rate() * 100.0,
            s.miss_rate() * 100.0,
            s.local_hits,
            s.shared_hits,
            s.filter_rejections,
            s.loads,
            s.load_failures,
            s.average_load_penalty(),
            s.reconciled,
            s.reconcile_drops
        );
    }
}

type SizeProbe = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Samples [`CacheStats`] on a fixed interval. Read-only.
pub struct StatsMonitor {
    cache_name: String,
    stats: Arc<CacheStats>,
    size: SizeProbe,
    interval: Duration,
    reporter: Arc<dyn StatsReporter>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl StatsMonitor {
    pub fn new(
        cache_name: impl Into<String>,
        stats: Arc<CacheStats>,
        size: impl Fn() -> u64 + Send + Sync + 'static,
        interval: Duration,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            stats,
            size: Arc::new(size),
            interval,
            reporter: Arc::new(TracingReporter),
            running: None,
        }
    }

    pub fn with_reporter(mut self, reporter: impl StatsReporter) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Current sample, without waiting for the next tick
    pub fn sample(&self) -> StatsSnapshot {
        self.stats.snapshot((self.size)())
    }

    /// Start sampling; the first sample is taken immediately. No-op if already running.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let name = self.cache_name.clone();
        let stats = Arc::clone(&self.stats);
        let size = Arc::clone(&self.size);
        let reporter = Arc::clone(&self.reporter);
        let period = self.interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = stats.snapshot(size());
                        reporter.report(&name, &snapshot);
                    }
                }
            }
            debug!("Stats monitor for cache {} stopped", name);
        });
        self.running = Some((cancel, handle));
    }

    /// Stop sampling and wait for the task to finish. No-op if not running.
    pub async fn stop(&mut self) {
        if let Some((cancel, handle)) = self.running.take() {
            cancel.cancel();
            let _ = handle.await;
        }
    }
}

impl Drop for StatsMonitor {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.running.take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_rates_are_derived() {
        let stats = CacheStats::new();
        stats.record_local_hit();
        stats.record_shared_hit();
        stats.record_miss();
        stats.record_filter_rejection();
        let s = stats.snapshot(7);
        assert_eq!(s.requests, 4);
        assert_eq!(s.hits, 2);
        assert_eq!(s.misses, 2);
        assert_eq!(s.filter_rejections, 1);
        assert_eq!(s.size, 7);
        assert!((s.hit_rate() - 0.5).abs() < f64::EPSILON);
        assert!((s.miss_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_stats() {
        let s = CacheStats::new().snapshot(0);
        assert_eq!(s.hit_rate(), 0.0);
        assert_eq!(s.average_load_penalty(), Duration::ZERO);
    }

    #[test]
    fn test_average_load_penalty() {
        let stats = CacheStats::new();
        stats.record_load(Duration::from_millis(10), true);
        stats.record_load(Duration::from_millis(30), false);
        let s = stats.snapshot(0);
        assert_eq!(s.loads, 2);
        assert_eq!(s.load_failures, 1);
        assert_eq!(s.average_load_penalty(), Duration::from_millis(20));
    }

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<StatsSnapshot>>>);

    impl StatsReporter for Collect {
        fn report(&self, _cache_name: &str, snapshot: &StatsSnapshot) {
            self.0.lock().unwrap().push(snapshot.clone());
        }
    }

    #[tokio::test]
    async fn test_monitor_start_stop() {
        let stats = Arc::new(CacheStats::new());
        stats.record_local_hit();
        let sink = Collect::default();
        let mut monitor = StatsMonitor::new("users", Arc::clone(&stats), || 3, Duration::from_millis(10))
            .with_reporter(sink.clone());

        monitor.start();
        assert!(monitor.is_running());
        tokio::time::sleep(Duration::from_millis(45)).await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        let samples = sink.0.lock().unwrap().len();
        assert!(samples >= 2, "samples: {}", samples);
        assert_eq!(sink.0.lock().unwrap()[0].size, 3);

        // Stopped monitors report nothing more
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sink.0.lock().unwrap().len(), samples);
        assert_eq!(monitor.sample().local_hits, 1);
    }
}
