use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use procpool_api::LatencyStats;
use serde::Serialize;

/// What a recorded value measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    TaskSubmitted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskTimedOut,
    WorkerRestarted,
    /// Nanoseconds a task spent executing.
    ExecutionTime,
    /// Nanoseconds a task spent queued.
    QueueTime,
}

/// Monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Count, total, min and max of recorded durations.
#[derive(Debug)]
pub struct LatencyTracker {
    count: AtomicU64,
    total_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }
}

impl LatencyTracker {
    pub fn record(&self, ns: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        let _ = self
            .min_ns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |min| (ns < min).then_some(ns));
        let _ = self
            .max_ns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |max| (ns > max).then_some(ns));
    }

    pub fn snapshot(&self) -> LatencyStats {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return LatencyStats::default();
        }
        let total = self.total_ns.load(Ordering::Relaxed);
        LatencyStats {
            count,
            total: Duration::from_nanos(total),
            min: Duration::from_nanos(self.min_ns.load(Ordering::Relaxed)),
            max: Duration::from_nanos(self.max_ns.load(Ordering::Relaxed)),
            avg: Duration::from_nanos(total / count),
        }
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.total_ns.store(0, Ordering::Relaxed);
        self.min_ns.store(u64::MAX, Ordering::Relaxed);
        self.max_ns.store(0, Ordering::Relaxed);
    }
}

/// Upper bounds of the latency histogram buckets, in microseconds. The last
/// bucket catches everything above.
pub const LATENCY_BUCKETS_US: [u64; 6] = [100, 1_000, 10_000, 100_000, 1_000_000, 10_000_000];

/// Fixed-bucket histogram.
#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [u64],
    buckets: Vec<AtomicU64>,
}

/// One histogram bucket; `le == None` is the overflow bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub le: Option<u64>,
    pub count: u64,
}

impl Histogram {
    pub fn new(bounds: &'static [u64]) -> Self {
        Self { bounds, buckets: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect() }
    }

    pub fn record(&self, value: u64) {
        let index = self.bounds.partition_point(|bound| *bound < value);
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<Bucket> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, count)| Bucket { le: self.bounds.get(i).copied(), count: count.load(Ordering::Relaxed) })
            .collect()
    }

    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
    }
}

/// Per-pool counters and latency registry.
///
/// Counters are always kept since pool statistics depend on them. Latency
/// trackers and the histogram only record while metrics are enabled.
#[derive(Debug)]
pub struct Metrics {
    enabled: AtomicBool,
    pub submitted: Counter,
    pub completed: Counter,
    pub failed: Counter,
    pub cancelled: Counter,
    pub timed_out: Counter,
    pub restarts: Counter,
    pub execution: LatencyTracker,
    pub queue: LatencyTracker,
    pub execution_histogram: Histogram,
}

impl Metrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            submitted: Counter::default(),
            completed: Counter::default(),
            failed: Counter::default(),
            cancelled: Counter::default(),
            timed_out: Counter::default(),
            restarts: Counter::default(),
            execution: LatencyTracker::default(),
            queue: LatencyTracker::default(),
            execution_histogram: Histogram::new(&LATENCY_BUCKETS_US),
        }
    }

    pub fn record(&self, metric: Metric, value: u64) {
        match metric {
            Metric::TaskSubmitted => self.submitted.add(value),
            Metric::TaskCompleted => self.completed.add(value),
            Metric::TaskFailed => self.failed.add(value),
            Metric::TaskCancelled => self.cancelled.add(value),
            Metric::TaskTimedOut => self.timed_out.add(value),
            Metric::WorkerRestarted => self.restarts.add(value),
            Metric::ExecutionTime if self.is_enabled() => {
                self.execution.record(value);
                self.execution_histogram.record(value / 1_000);
            }
            Metric::QueueTime if self.is_enabled() => self.queue.record(value),
            Metric::ExecutionTime | Metric::QueueTime => {}
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn reset_latencies(&self) {
        self.execution.reset();
        self.queue.reset();
        self.execution_histogram.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_tracker_aggregates() {
        let tracker = LatencyTracker::default();
        assert_eq!(tracker.snapshot(), LatencyStats::default());
        for ns in [300, 100, 200] {
            tracker.record(ns);
        }
        let stats = tracker.snapshot();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, Duration::from_nanos(100));
        assert_eq!(stats.max, Duration::from_nanos(300));
        assert_eq!(stats.avg, Duration::from_nanos(200));
        tracker.reset();
        assert_eq!(tracker.snapshot().count, 0);
    }

    #[test]
    fn test_histogram_buckets() {
        let histogram = Histogram::new(&LATENCY_BUCKETS_US);
        histogram.record(50);
        histogram.record(100);
        histogram.record(101);
        histogram.record(u64::MAX);
        let buckets = histogram.snapshot();
        assert_eq!(buckets.len(), LATENCY_BUCKETS_US.len() + 1);
        assert_eq!(buckets[0], Bucket { le: Some(100), count: 2 });
        assert_eq!(buckets[1].count, 1);
        assert_eq!(buckets.last().unwrap(), &Bucket { le: None, count: 1 });
    }

    #[test]
    fn test_disabled_metrics_keep_counters() {
        let metrics = Metrics::new(false);
        metrics.record(Metric::TaskCompleted, 1);
        metrics.record(Metric::ExecutionTime, 5_000);
        assert_eq!(metrics.completed.get(), 1);
        assert_eq!(metrics.execution.snapshot().count, 0);

        metrics.set_enabled(true);
        metrics.record(Metric::ExecutionTime, 5_000);
        assert_eq!(metrics.execution.snapshot().count, 1);
    }
}
