//! The pool manager and the state it shares with the event loop.
//!
//! - [`manager`]: the public [`PoolManager`]
//! - [`shared`]: counters, live settings and queues shared across threads
//! - [`workers`]: worker slots and the topology lock
//! - [`metrics`]: counters, latency trackers and histograms

pub mod manager;
pub mod metrics;
pub mod shared;
pub mod workers;

pub use manager::PoolManager;
pub use metrics::{Bucket, Counter, Histogram, LatencyTracker, Metric, Metrics, LATENCY_BUCKETS_US};
pub use shared::PoolShared;
pub use workers::{TopologyGuard, WorkerSet};
