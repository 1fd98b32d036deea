//! Pool telemetry.
//!
//! With the `telemetry` feature the pool records per-outcome counters and an
//! execution-time histogram. Without it the same surface compiles to no-ops.

#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub use metrics::{Metrics, MetricsSnapshot};

// Stub implementations when telemetry is disabled
#[cfg(not(feature = "telemetry"))]
pub mod metrics {
    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    pub struct Metrics;

    impl Metrics {
        pub fn new() -> Self { Self }
        pub fn record_task_submitted(&self) {}
        pub fn record_task_execution(&self, _: u64) {}
        pub fn record_task_failed(&self) {}
        pub fn record_task_cancelled(&self) {}
        pub fn record_task_panic(&self) {}
        pub fn snapshot(&self) -> MetricsSnapshot { MetricsSnapshot::default() }
        pub fn reset(&self) {}
    }

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
}

#[cfg(not(feature = "telemetry"))]
pub use metrics::{Metrics, MetricsSnapshot};
