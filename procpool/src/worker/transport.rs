use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use procpool_api::{Result, WorkerId};

use super::process::ProcessTransport;
use super::runner::WorkerRuntime;
use super::thread::ThreadTransport;
use crate::config::TransportKind;
use crate::ipc::WorkerSegment;

/// How worker execution contexts are created.
///
/// The segment is always created first and handed to `spawn`, so it exists
/// before the worker does and outlives it.
pub trait WorkerTransport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Allocates the shared memory for one worker.
    fn create_segment(
        &self,
        pool_name: &str,
        worker_id: WorkerId,
        slot_count: usize,
        slot_size: usize,
    ) -> Result<WorkerSegment>;

    /// Starts a worker that runs `runtime` over `segment`.
    fn spawn(&self, runtime: Arc<WorkerRuntime>, segment: WorkerSegment) -> Result<Arc<dyn WorkerHandle>>;
}

/// Master-side control over one spawned worker.
pub trait WorkerHandle: Send + Sync + fmt::Debug {
    fn segment(&self) -> &WorkerSegment;

    /// OS process id, for process workers.
    fn pid(&self) -> Option<u32>;

    /// Writes an encoded frame to the worker.
    fn send(&self, frame: &[u8], timeout: Duration) -> Result<()> {
        self.segment().tasks().enqueue(frame, timeout)
    }

    /// Reads the next frame from the worker; `Ok(false)` if none arrived in time.
    fn receive(&self, out: &mut Vec<u8>, timeout: Duration) -> Result<bool> {
        self.segment().results().dequeue_into(out, timeout)
    }

    /// `Ok(false)` once the worker has exited.
    fn check_alive(&self) -> Result<bool>;

    /// Asks the worker to exit; `force` kills it outright.
    fn terminate(&self, force: bool) -> Result<()>;

    /// Waits up to `timeout` for the worker to exit; `Ok(true)` if it did.
    fn wait_exit(&self, timeout: Duration) -> Result<bool>;
}

/// Transport implementation for `kind`.
pub fn transport_for(kind: TransportKind) -> Arc<dyn WorkerTransport> {
    match kind {
        TransportKind::Process => Arc::new(ProcessTransport),
        TransportKind::Thread => Arc::new(ThreadTransport),
    }
}
