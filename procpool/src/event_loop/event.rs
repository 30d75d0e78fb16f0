use std::fmt;

use procpool_api::{TaskId, WorkerId};

use crate::config::RuntimeTuning;
use crate::ipc::ResultFrame;
use crate::worker::DeathCause;

/// Operating-system signals the pool reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSignal {
    /// SIGTERM: orderly stop.
    Terminate,
    /// SIGINT: orderly stop.
    Interrupt,
    /// SIGCHLD: a child exited; sweep worker liveness.
    ChildExited,
    /// SIGUSR1: write pool statistics to the log.
    DumpStats,
    /// SIGUSR2: toggle debug mode.
    ToggleDebug,
}

/// Commands accepted by a running event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Leave the loop after the current iteration.
    Stop,
    /// Apply new runtime settings without restarting workers.
    Reload(RuntimeTuning),
    /// Release cached buffers, reset latency trackers and reap failed workers.
    ForceCleanup,
}

/// Everything the event loop reacts to.
#[derive(Debug)]
pub enum Event {
    /// New tasks are waiting in the admission queue.
    TaskSubmitted,
    /// The worker set changed; idle capacity may be available.
    WorkersChanged,
    /// A running task was cancelled by its caller.
    TaskCancelled(TaskId),
    /// A worker produced a result frame.
    ResultReady { worker_id: WorkerId, generation: u64, result: ResultFrame },
    /// A worker was found dead by its monitor.
    WorkerStatus { worker_id: WorkerId, generation: u64, cause: DeathCause },
    Signal(PoolSignal),
    Control(ControlCommand),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskSubmitted => write!(f, "task-submitted"),
            Self::WorkersChanged => write!(f, "workers-changed"),
            Self::TaskCancelled(id) => write!(f, "task-cancelled({})", id),
            Self::ResultReady { worker_id, result, .. } => {
                write!(f, "result-ready(worker {}, task {})", worker_id, result.task_id)
            }
            Self::WorkerStatus { worker_id, cause, .. } => write!(f, "worker-status({}: {})", worker_id, cause),
            Self::Signal(signal) => write!(f, "signal({:?})", signal),
            Self::Control(command) => write!(f, "control({:?})", command),
        }
    }
}
