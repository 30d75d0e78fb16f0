//! Worker execution contexts and their supervision.
//!
//! - [`transport`]: the [`WorkerTransport`] / [`WorkerHandle`] seam
//! - [`process`]: forked worker processes over named shared memory
//! - [`thread`]: worker threads over anonymous shared memory
//! - [`runner`]: the loop every worker runs
//! - [`supervisor`]: master-side lifecycle, monitoring and messaging

pub mod process;
pub mod runner;
pub mod supervisor;
pub mod thread;
pub mod transport;

pub use process::{ProcessHandle, ProcessTransport};
pub use runner::{run_worker, ExitReason, WorkerRuntime};
pub use supervisor::{DeathCause, SupervisorContext, WorkerSupervisor};
pub use thread::{ThreadHandle, ThreadTransport};
pub use transport::{transport_for, WorkerHandle, WorkerTransport};
