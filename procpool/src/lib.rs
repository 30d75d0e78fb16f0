// procpool: a self-scaling worker-process pool
//
// The master keeps a bounded set of worker processes (or threads), feeds them
// tasks over shared-memory channels from a single event loop, restarts the
// ones that die and grows or shrinks the set with demand. The data model lives
// in `procpool-api` and is re-exported here.

pub mod clock;
pub mod config;
pub mod event_loop;
pub mod handler;
pub mod ipc;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod task;
pub mod worker;

#[doc(hidden)]
pub use tracing;

// Re-export commonly used types
pub use config::{PoolConfig, RestartPolicy, RuntimeTuning, TransportKind};
pub use event_loop::{ControlCommand, PoolSignal};
pub use handler::{echo_handler, handler_fn, HandlerContext, TaskHandler, UserContext};
pub use pool::PoolManager;
pub use procpool_api::*;
pub use task::{cancel_all, wait_all, wait_all_async, TaskFuture};
