//! Metrics collection for pool monitoring.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Pool-wide metrics, shared by every worker of a pool.
#[derive(Debug)]
pub struct Metrics {
    tasks_submitted: AtomicU64,
    tasks_executed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_cancelled: AtomicU64,
    tasks_panicked: AtomicU64,

    // execution time per task, in nanoseconds
    latency_histogram: RwLock<Option<Histogram<u64>>>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        // 3 significant figures, max one hour in nanoseconds
        let histogram = Histogram::new_with_max(3_600_000_000_000, 3).ok();

        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_executed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
            latency_histogram: RwLock::new(histogram),
            start_time: Instant::now(),
        }
    }

    pub fn record_task_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished execution, whatever its outcome.
    pub fn record_task_execution(&self, duration_ns: u64) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);

        // a contended histogram drops the sample rather than stalling a worker
        if let Some(mut guard) = self.latency_histogram.try_write() {
            if let Some(hist) = guard.as_mut() {
                hist.saturating_record(duration_ns);
            }
        }
    }

    pub fn record_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_panic(&self) {
        self.tasks_panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let histogram = self.latency_histogram.read();
        let quantile = |q: f64| {
            histogram
                .as_ref()
                .map(|h| h.value_at_quantile(q))
                .unwrap_or(0)
        };

        MetricsSnapshot {
            uptime: self.start_time.elapsed(),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            tasks_panicked: self.tasks_panicked.load(Ordering::Relaxed),
            avg_latency_ns: histogram
                .as_ref()
                .filter(|h| h.len() > 0)
                .map(|h| h.mean() as u64)
                .unwrap_or(0),
            p50_latency_ns: quantile(0.50),
            p99_latency_ns: quantile(0.99),
            max_latency_ns: histogram.as_ref().map(|h| h.max()).unwrap_or(0),
        }
    }

    pub fn reset(&self) {
        self.tasks_submitted.store(0, Ordering::Relaxed);
        self.tasks_executed.store(0, Ordering::Relaxed);
        self.tasks_failed.store(0, Ordering::Relaxed);
        self.tasks_cancelled.store(0, Ordering::Relaxed);
        self.tasks_panicked.store(0, Ordering::Relaxed);

        if let Some(hist) = self.latency_histogram.write().as_mut() {
            hist.reset();
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub uptime: Duration,
    pub tasks_submitted: u64,
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_panicked: u64,
    pub avg_latency_ns: u64,
    pub p50_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl MetricsSnapshot {
    /// Executions that delivered a success outcome.
    pub fn tasks_succeeded(&self) -> u64 {
        self.tasks_executed
            .saturating_sub(self.tasks_failed + self.tasks_cancelled + self.tasks_panicked)
    }

    pub fn tasks_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.tasks_executed as f64 / seconds
    }
}
