//! Task records, caller-facing futures and the per-pool allocator.

pub mod allocator;
pub mod future;
pub mod record;

pub use allocator::{AllocatorStats, TaskAllocator, MAX_FREE_BUFFERS};
pub use future::{cancel_all, wait_all, wait_all_async, TaskFuture};
pub use record::{FinishHook, Outcome, Task};
