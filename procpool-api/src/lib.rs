//! # procpool API
//!
//! Data model shared by the `procpool` engine and its callers: error
//! taxonomy, task descriptors and results, worker snapshots and pool
//! statistics. The crate holds no behaviour beyond small helpers, so it can be
//! depended on without pulling in the engine.
//!
//! ## Core Types
//!
//! - [`TaskDesc`]: what to run, with priority, handler name and callback
//! - [`TaskResult`]: the outcome of a finished task
//! - [`WorkerInfo`]: a snapshot of one worker slot
//! - [`PoolStats`]: a snapshot of pool counters and latencies
//! - [`PoolError`]: the error returned by every fallible pool operation
//!
//! ## Module Organization
//!
//! - [`errors`]: error taxonomy and numeric codes
//! - [`priority`]: task priority levels
//! - [`task`]: task states, descriptors and results
//! - [`worker`]: worker states and snapshots
//! - [`stats`]: pool states and statistics

pub mod errors;
pub mod priority;
pub mod stats;
pub mod task;
pub mod worker;

pub use errors::{ErrorCode, PoolError, Result, TaskFailure};
pub use priority::TaskPriority;
pub use stats::{LatencyStats, PoolState, PoolStats};
pub use task::{TaskCallback, TaskDesc, TaskId, TaskResult, TaskState, MAX_TASK_NAME_LEN};
pub use worker::{WorkerId, WorkerInfo, WorkerState, MAX_WORKERS};

pub const VERSION_MAJOR: u32 = 2;
pub const VERSION_MINOR: u32 = 0;
pub const VERSION_PATCH: u32 = 0;

/// Library version as `major.minor.patch`.
pub fn version() -> &'static str {
    "2.0.0"
}

/// Maximum size in bytes of a task input or output payload.
pub const MAX_TASK_DATA_SIZE: usize = 64 * 1024;

/// Default capacity of the pending-task queue.
pub const DEFAULT_QUEUE_SIZE: usize = 4096;
