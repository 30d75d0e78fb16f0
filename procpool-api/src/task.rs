//! # Task Descriptors and Results
//!
//! Plain data describing a unit of work before submission ([`TaskDesc`]), the
//! lifecycle states it moves through ([`TaskState`]) and the record a caller
//! receives once it has finished ([`TaskResult`]).
//!
//! ## State Transitions
//!
//! ```text
//! Pending ──► Running ──► Completed | Failed | TimedOut | Cancelled
//!    │
//!    └──────► Cancelled | Failed
//! ```
//!
//! Transitions only move forward; a terminal state is never left.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ErrorCode;
use crate::priority::TaskPriority;
use crate::worker::WorkerId;

/// Unique, monotonically increasing task identifier. Zero is never issued.
pub type TaskId = u64;

/// Maximum length in bytes of a task name.
pub const MAX_TASK_NAME_LEN: usize = 64;

/// Callback invoked once with the final result of a task.
pub type TaskCallback = Arc<dyn Fn(&TaskResult) + Send + Sync>;

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskState {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    TimedOut = 4,
    Cancelled = 5,
}

impl TaskState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Running),
            2 => Some(Self::Completed),
            3 => Some(Self::Failed),
            4 => Some(Self::TimedOut),
            5 => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether moving from `self` to `next` keeps the state machine monotonic.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled | Self::Failed),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Describes a task before it is submitted.
#[derive(Clone, Default)]
pub struct TaskDesc {
    /// Display name, truncated to [`MAX_TASK_NAME_LEN`] bytes on submission.
    pub name: String,

    pub priority: TaskPriority,

    /// Name of a registered handler; `None` selects the pool's default handler.
    pub handler: Option<String>,

    /// Wait bound used by `submit_sync`.
    pub timeout: Option<Duration>,

    /// Invoked once after the task reaches a terminal state.
    pub callback: Option<TaskCallback>,

    /// Opaque caller correlation id carried into logs.
    pub trace_id: Option<String>,
}

impl TaskDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TaskResult) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

impl fmt::Debug for TaskDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDesc")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("handler", &self.handler)
            .field("timeout", &self.timeout)
            .field("has_callback", &self.callback.is_some())
            .field("trace_id", &self.trace_id)
            .finish()
    }
}

/// Final outcome of a task.
///
/// Timestamps are monotonic nanoseconds; a zero timestamp means the task never
/// reached that point (for example a task cancelled while pending has no start).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub state: TaskState,
    /// `0` on success, otherwise an [`ErrorCode`] value or a handler-chosen code.
    pub code: i32,
    pub message: Option<String>,
    pub output: Option<Vec<u8>>,
    pub worker_id: Option<WorkerId>,
    pub submit_ns: u64,
    pub start_ns: u64,
    pub end_ns: u64,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.state == TaskState::Completed && self.code == 0
    }

    /// The result code as a known [`ErrorCode`], if it is one.
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_i32(self.code)
    }

    /// Output bytes, empty when the task produced none.
    pub fn output_bytes(&self) -> &[u8] {
        self.output.as_deref().unwrap_or(&[])
    }

    /// Time spent queued before a worker picked the task up.
    pub fn queue_time(&self) -> Duration {
        if self.start_ns == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.start_ns.saturating_sub(self.submit_ns))
    }

    /// Time spent executing on a worker.
    pub fn execution_time(&self) -> Duration {
        if self.start_ns == 0 || self.end_ns == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.end_ns.saturating_sub(self.start_ns))
    }

    /// Time from submission to the terminal state.
    pub fn total_time(&self) -> Duration {
        if self.end_ns == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.end_ns.saturating_sub(self.submit_ns))
    }
}
