//! Pool-wide statistics and lifecycle state.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PoolState {
    /// Pool is created but not started
    Created = 0,
    /// Pool is spawning its initial workers
    Starting = 1,
    /// Pool accepts and dispatches tasks
    Running = 2,
    /// Pool is draining and stopping workers
    Stopping = 3,
    /// Pool has completed shutdown
    Stopped = 4,
}

impl PoolState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Created),
            1 => Some(Self::Starting),
            2 => Some(Self::Running),
            3 => Some(Self::Stopping),
            4 => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Aggregate of a latency tracker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
}

/// Snapshot returned by `get_stats`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub state: PoolState,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_timed_out: u64,
    pub total_restarts: u64,
    pub avg_task_time: Duration,
    pub max_task_time: Duration,
    pub avg_queue_time: Duration,
    pub execution_latency: LatencyStats,
    pub queue_latency: LatencyStats,
    pub uptime: Duration,
    /// A worker slot exhausted its restart budget and stays empty.
    pub degraded: bool,
    pub debug_mode: bool,
}

impl PoolStats {
    /// Empty statistics for a pool in `state`.
    pub fn empty(state: PoolState) -> Self {
        Self {
            state,
            active_workers: 0,
            idle_workers: 0,
            pending_tasks: 0,
            running_tasks: 0,
            total_submitted: 0,
            total_completed: 0,
            total_failed: 0,
            total_cancelled: 0,
            total_timed_out: 0,
            total_restarts: 0,
            avg_task_time: Duration::ZERO,
            max_task_time: Duration::ZERO,
            avg_queue_time: Duration::ZERO,
            execution_latency: LatencyStats::default(),
            queue_latency: LatencyStats::default(),
            uptime: Duration::ZERO,
            degraded: false,
            debug_mode: false,
        }
    }

    /// Tasks that reached any terminal state.
    pub fn total_finished(&self) -> u64 {
        self.total_completed + self.total_failed + self.total_cancelled + self.total_timed_out
    }
}
