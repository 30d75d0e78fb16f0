use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use procpool_api::{PoolError, Result, WorkerId};
use tracing::{debug, warn};

use super::runner::{run_worker, WorkerRuntime};
use super::transport::{WorkerHandle, WorkerTransport};
use crate::config::TransportKind;
use crate::ipc::WorkerSegment;

const EXIT_POLL: Duration = Duration::from_millis(5);

/// How often a worker process checks that the pool process is still there.
const PARENT_POLL: Duration = Duration::from_millis(100);

// Child exit codes
const EXIT_OK: i32 = 0;
const EXIT_RUNNER_ERROR: i32 = 2;
const EXIT_PANIC: i32 = 3;

const RESET_SIGNALS: [libc::c_int; 6] =
    [libc::SIGTERM, libc::SIGINT, libc::SIGCHLD, libc::SIGUSR1, libc::SIGUSR2, libc::SIGPIPE];

/// Forks one OS process per worker, talking over named shared memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTransport;

impl WorkerTransport for ProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    fn create_segment(
        &self,
        pool_name: &str,
        worker_id: WorkerId,
        slot_count: usize,
        slot_size: usize,
    ) -> Result<WorkerSegment> {
        WorkerSegment::create_named(pool_name, worker_id, slot_count, slot_size)
    }

    fn spawn(&self, runtime: Arc<WorkerRuntime>, segment: WorkerSegment) -> Result<Arc<dyn WorkerHandle>> {
        let parent = unsafe { libc::getpid() };
        match unsafe { libc::fork() } {
            -1 => Err(PoolError::last_os_error("fork")),
            0 => child_main(&runtime, &segment, parent),
            pid => {
                segment.set_pid(pid as u32);
                debug!("[{}] Forked worker {} as pid {}", runtime.pool_name, segment.worker_id(), pid);
                Ok(Arc::new(ProcessHandle { segment, pid, exit_status: Mutex::new(None) }))
            }
        }
    }
}

// Runs in the forked child and never returns.
fn child_main(runtime: &WorkerRuntime, segment: &WorkerSegment, parent: libc::pid_t) -> ! {
    unsafe {
        for signal in RESET_SIGNALS {
            libc::signal(signal, libc::SIG_DFL);
        }
        let mut empty = std::mem::zeroed::<libc::sigset_t>();
        libc::sigemptyset(&mut empty);
        libc::pthread_sigmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());

        if libc::getppid() != parent {
            libc::_exit(EXIT_RUNNER_ERROR);
        }
    }

    // Handler panics are reported through results, not stderr
    panic::set_hook(Box::new(|_| {}));
    segment.set_pid(unsafe { libc::getpid() } as u32);

    let abandoned = AtomicBool::new(false);
    let code = thread::scope(|scope| {
        scope.spawn(|| watch_parent(parent, &abandoned));
        let code = match panic::catch_unwind(AssertUnwindSafe(|| run_worker(runtime, segment, &abandoned))) {
            Ok(Ok(_)) => EXIT_OK,
            Ok(Err(_)) => EXIT_RUNNER_ERROR,
            Err(_) => EXIT_PANIC,
        };
        abandoned.store(true, Ordering::Release);
        code
    });
    unsafe { libc::_exit(code) }
}

// Abandons the runner once the pool process is gone and the child has been
// re-parented. Tied to the process, not to the thread that forked us.
fn watch_parent(parent: libc::pid_t, abandoned: &AtomicBool) {
    while !abandoned.load(Ordering::Acquire) {
        if unsafe { libc::getppid() } != parent {
            abandoned.store(true, Ordering::Release);
            return;
        }
        thread::sleep(PARENT_POLL);
    }
}

/// Handle to a forked worker process.
#[derive(Debug)]
pub struct ProcessHandle {
    segment: WorkerSegment,
    pid: libc::pid_t,
    exit_status: Mutex<Option<i32>>,
}

impl ProcessHandle {
    /// Raw `waitpid` status once the child has been reaped.
    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reap(&self, options: libc::c_int) -> Result<bool> {
        let mut exit_status = self.exit_status.lock().unwrap_or_else(PoisonError::into_inner);
        if exit_status.is_some() {
            return Ok(true);
        }

        let mut status = 0;
        match unsafe { libc::waitpid(self.pid, &mut status, options) } {
            0 => Ok(false),
            pid if pid == self.pid => {
                *exit_status = Some(status);
                Ok(true)
            }
            _ => {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ECHILD) {
                    // Reaped elsewhere; the process is gone either way
                    *exit_status = Some(-1);
                    return Ok(true);
                }
                Err(PoolError::syscall(format!("waitpid({})", self.pid), err))
            }
        }
    }
}

impl WorkerHandle for ProcessHandle {
    fn segment(&self) -> &WorkerSegment {
        &self.segment
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid as u32)
    }

    fn check_alive(&self) -> Result<bool> {
        Ok(!self.reap(libc::WNOHANG)?)
    }

    fn terminate(&self, force: bool) -> Result<()> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        if unsafe { libc::kill(self.pid, signal) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(PoolError::syscall(format!("kill({})", self.pid), err));
            }
        }
        Ok(())
    }

    fn wait_exit(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.reap(libc::WNOHANG)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(EXIT_POLL);
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exit_status().is_some() {
            return;
        }
        warn!("Worker pid {} still running on drop; killing it", self.pid);
        unsafe { libc::kill(self.pid, libc::SIGKILL) };
        if let Err(err) = self.reap(0) {
            warn!("Failed to reap worker pid {}: {}", self.pid, err);
        }
    }
}
