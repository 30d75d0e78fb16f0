use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use procpool_api::{PoolError, Result, WorkerId};
use tracing::{debug, error, warn};

use super::runner::{run_worker, WorkerRuntime};
use super::transport::{WorkerHandle, WorkerTransport};
use crate::config::TransportKind;
use crate::ipc::WorkerSegment;

const EXIT_POLL: Duration = Duration::from_millis(5);

/// Runs each worker on a dedicated OS thread of the master over an
/// anonymous mapping. Handlers share the master's address space.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadTransport;

impl WorkerTransport for ThreadTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Thread
    }

    fn create_segment(
        &self,
        _pool_name: &str,
        worker_id: WorkerId,
        slot_count: usize,
        slot_size: usize,
    ) -> Result<WorkerSegment> {
        WorkerSegment::create_anonymous(worker_id, slot_count, slot_size)
    }

    fn spawn(&self, runtime: Arc<WorkerRuntime>, segment: WorkerSegment) -> Result<Arc<dyn WorkerHandle>> {
        let abandoned = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let worker_id = segment.worker_id();

        let join = {
            let (segment, abandoned, finished) = (segment.clone(), abandoned.clone(), finished.clone());
            thread::Builder::new()
                .name(format!("{}-worker-{}", runtime.pool_name, worker_id))
                .spawn(move || {
                    match run_worker(&runtime, &segment, &abandoned) {
                        Ok(reason) => debug!("[{}] Worker {} exited: {:?}", runtime.pool_name, worker_id, reason),
                        Err(err) => error!("[{}] Worker {} failed: {}", runtime.pool_name, worker_id, err),
                    }
                    finished.store(true, Ordering::Release);
                })
                .map_err(|e| PoolError::syscall(format!("spawn worker thread {}", worker_id), e))?
        };

        Ok(Arc::new(ThreadHandle { segment, abandoned, finished, join: Mutex::new(Some(join)) }))
    }
}

/// Handle to a thread worker.
#[derive(Debug)]
pub struct ThreadHandle {
    segment: WorkerSegment,
    abandoned: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadHandle {
    fn join_if_finished(&self) {
        if !self.finished.load(Ordering::Acquire) {
            return;
        }
        let handle = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Worker thread {} panicked", self.segment.worker_id());
            }
        }
    }
}

impl WorkerHandle for ThreadHandle {
    fn segment(&self) -> &WorkerSegment {
        &self.segment
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn check_alive(&self) -> Result<bool> {
        Ok(!self.finished.load(Ordering::Acquire) && !self.abandoned.load(Ordering::Acquire))
    }

    /// A thread cannot be killed. Forced termination abandons it: it counts as
    /// exited immediately and stops at its next check.
    fn terminate(&self, force: bool) -> Result<()> {
        self.segment.request_shutdown();
        if force {
            self.abandoned.store(true, Ordering::Release);
            self.segment.tasks().close();
        }
        Ok(())
    }

    fn wait_exit(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.finished.load(Ordering::Acquire) {
                self.join_if_finished();
                return Ok(true);
            }
            if self.abandoned.load(Ordering::Acquire) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(EXIT_POLL);
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Acquire) {
            self.abandoned.store(true, Ordering::Release);
            self.segment.tasks().close();
        }
        self.join_if_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistry;

    fn runtime() -> Arc<WorkerRuntime> {
        Arc::new(WorkerRuntime {
            pool_name: "thread-test".to_string(),
            handlers: HandlerRegistry::default(),
            user_context: None,
            heartbeat_interval: Duration::from_millis(100),
        })
    }

    #[test]
    fn test_graceful_terminate_exits() {
        let segment = ThreadTransport.create_segment("thread-test", 0, 2, 256).unwrap();
        let handle = ThreadTransport.spawn(runtime(), segment).unwrap();
        assert!(handle.check_alive().unwrap());
        assert_eq!(handle.pid(), None);

        handle.terminate(false).unwrap();
        assert!(handle.wait_exit(Duration::from_secs(2)).unwrap());
        assert!(!handle.check_alive().unwrap());
    }

    #[test]
    fn test_forced_terminate_abandons() {
        let segment = ThreadTransport.create_segment("thread-test", 1, 2, 256).unwrap();
        let handle = ThreadTransport.spawn(runtime(), segment).unwrap();
        handle.terminate(true).unwrap();
        assert!(!handle.check_alive().unwrap());
        assert!(handle.wait_exit(Duration::ZERO).unwrap());
    }
}
