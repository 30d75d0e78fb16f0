//! # Pool Error Types
//!
//! This module defines the error taxonomy shared by the pool engine and its
//! callers. Every fallible pool operation returns a [`PoolError`]; every
//! finished task carries a numeric [`ErrorCode`] in its result.
//!
//! ## Error Classification
//!
//! - `InvalidParameter`: bad configuration, oversized payloads, illegal state changes
//! - `OutOfMemory`: allocation of a pool resource failed
//! - `SystemCall`: an OS primitive (shm, mmap, fork, pthread) failed
//! - `Timeout`: a bounded wait expired before its predicate held
//! - `QueueFull`: backpressure from the pending-task queue
//! - `WorkerDead`: the target worker failed its liveness check
//! - `ShutdownInProgress`: the pool no longer accepts work
//!
//! ## Usage Example
//!
//! ```rust
//! use procpool_api::errors::{ErrorCode, PoolError};
//!
//! fn describe(error: &PoolError) -> &'static str {
//!     match error.code() {
//!         ErrorCode::QueueFull => "slow down",
//!         ErrorCode::Timeout => "try again later",
//!         _ => "fatal",
//!     }
//! }
//! ```

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric status codes carried in task results and exposed to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    InvalidParameter = -1,
    OutOfMemory = -2,
    SystemCallFailure = -3,
    Timeout = -4,
    QueueFull = -5,
    WorkerDead = -6,
    ShutdownInProgress = -7,
    /// The task handler itself returned an error or panicked.
    HandlerFailed = -8,
}

impl ErrorCode {
    /// Raw numeric value of the code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Maps a raw value back to a known code.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            -1 => Some(Self::InvalidParameter),
            -2 => Some(Self::OutOfMemory),
            -3 => Some(Self::SystemCallFailure),
            -4 => Some(Self::Timeout),
            -5 => Some(Self::QueueFull),
            -6 => Some(Self::WorkerDead),
            -7 => Some(Self::ShutdownInProgress),
            -8 => Some(Self::HandlerFailed),
            _ => None,
        }
    }

    /// Human readable description of the code.
    pub fn description(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::InvalidParameter => "Invalid parameter",
            Self::OutOfMemory => "Out of memory",
            Self::SystemCallFailure => "System call failed",
            Self::Timeout => "Operation timed out",
            Self::QueueFull => "Queue is full",
            Self::WorkerDead => "Worker process is dead",
            Self::ShutdownInProgress => "Pool is shutting down",
            Self::HandlerFailed => "Task handler failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Errors returned by pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("System call failed ({context}): {source}")]
    SystemCall {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task queue is full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    #[error("Worker {worker_id} is dead")]
    WorkerDead { worker_id: u32 },

    #[error("Pool is shutting down")]
    ShutdownInProgress,

    #[error("Internal pool error: {0}")]
    Other(#[from] anyhow::Error),
}

impl PoolError {
    /// Wraps an OS error with the name of the failing call.
    pub fn syscall(context: impl Into<String>, source: io::Error) -> Self {
        Self::SystemCall { context: context.into(), source }
    }

    /// Captures `errno` right after a failed libc call.
    pub fn last_os_error(context: impl Into<String>) -> Self {
        Self::syscall(context, io::Error::last_os_error())
    }

    /// Builds a `SystemCall` error from a pthread-style return code.
    pub fn from_errno(context: impl Into<String>, errno: i32) -> Self {
        Self::syscall(context, io::Error::from_raw_os_error(errno))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParameter(_) => ErrorCode::InvalidParameter,
            Self::OutOfMemory(_) => ErrorCode::OutOfMemory,
            Self::SystemCall { .. } | Self::Other(_) => ErrorCode::SystemCallFailure,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::QueueFull { .. } => ErrorCode::QueueFull,
            Self::WorkerDead { .. } => ErrorCode::WorkerDead,
            Self::ShutdownInProgress => ErrorCode::ShutdownInProgress,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Error a task handler can return to choose the result code explicitly.
///
/// Any other handler error is reported as [`ErrorCode::HandlerFailed`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct TaskFailure {
    pub code: i32,
    pub message: String,
}

impl TaskFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Result alias used across the pool.
pub type Result<T> = std::result::Result<T, PoolError>;
