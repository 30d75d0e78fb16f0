//! Worker identifiers, lifecycle states and the snapshot returned by
//! `get_workers`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Index of a worker slot inside its pool. Replacements reuse the id.
pub type WorkerId = u32;

/// Hard cap on the number of workers a pool can run.
pub const MAX_WORKERS: usize = 128;

/// States a worker can be in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WorkerState {
    /// Worker has been created but not started yet
    Created = 0,
    /// Worker process is being spawned
    Starting = 1,
    /// Worker is accepting tasks
    Running = 2,
    /// Worker is in the process of stopping
    Stopping = 3,
    /// Worker has been stopped
    Stopped = 4,
    /// Worker died or failed to start
    Error = 5,
}

impl WorkerState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Created),
            1 => Some(Self::Starting),
            2 => Some(Self::Running),
            3 => Some(Self::Stopping),
            4 => Some(Self::Stopped),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    /// Forward-only transitions plus `Error -> Created` for restarts.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Error, Created)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of one worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    /// OS process id; `None` for thread-isolated workers.
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub tasks_processed: u64,
    /// Monotonic nanoseconds of the last heartbeat seen from the worker.
    pub last_heartbeat_ns: u64,
    pub current_task_id: Option<TaskId>,
    /// How many times this slot has been restarted after a death.
    pub restarts: u32,
}

impl WorkerInfo {
    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Running && self.current_task_id.is_none()
    }
}
