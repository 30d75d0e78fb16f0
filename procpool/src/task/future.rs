use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use procpool_api::{PoolError, Result, TaskId, TaskResult, TaskState};

use super::record::Task;

/// Caller-side handle to a submitted task.
///
/// Cloning a future adds another reference to the same task. Dropping it
/// only releases that reference; the scheduler keeps its own until the task
/// is finished.
#[derive(Clone, Debug)]
pub struct TaskFuture {
    task: Arc<Task>,
}

impl TaskFuture {
    pub fn new(task: Arc<Task>) -> Self {
        Self { task }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    pub fn is_done(&self) -> bool {
        self.task.is_terminal()
    }

    /// Blocks until the task finishes or `timeout` passes.
    ///
    /// A timeout only ends the wait; the task keeps running.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<TaskResult> {
        self.task.wait(timeout)
    }

    pub async fn wait_async(&self, timeout: Option<Duration>) -> Result<TaskResult> {
        self.task.wait_async(timeout).await
    }

    pub fn cancel(&self) -> Result<()> {
        self.task.cancel()
    }

    /// Result of a finished task without waiting.
    pub fn result(&self) -> Option<TaskResult> {
        self.task.try_result()
    }

    /// Strong references to the underlying task, this handle included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.task)
    }
}

/// Waits for every future under one shared deadline.
///
/// Returns all results when every task completed successfully. Otherwise
/// the first failure is reported: a wait timeout as `Timeout`, a task that
/// did not complete as an error carrying its code and message.
pub fn wait_all(futures: &[TaskFuture], timeout: Option<Duration>) -> Result<Vec<TaskResult>> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut results = Vec::with_capacity(futures.len());
    for future in futures {
        let remaining = deadline.map(|at| at.saturating_duration_since(Instant::now()));
        let result = future.wait(remaining).map_err(|err| match (err, timeout) {
            (PoolError::Timeout(_), Some(total)) => PoolError::Timeout(total),
            (err, _) => err,
        })?;
        if !result.is_success() {
            return Err(unsuccessful(&result));
        }
        results.push(result);
    }
    Ok(results)
}

/// Async counterpart of [`wait_all`]; waits on every future concurrently and
/// returns each outcome in order.
pub async fn wait_all_async(futures: &[TaskFuture], timeout: Option<Duration>) -> Vec<Result<TaskResult>> {
    join_all(futures.iter().map(|f| f.wait_async(timeout))).await
}

/// Cancels every future, returning the last error seen.
pub fn cancel_all(futures: &[TaskFuture]) -> Result<()> {
    let mut last_error = None;
    for future in futures {
        if let Err(err) = future.cancel() {
            last_error = Some(err);
        }
    }
    last_error.map_or(Ok(()), Err)
}

fn unsuccessful(result: &TaskResult) -> PoolError {
    let message = result.message.clone().unwrap_or_else(|| result.state.to_string());
    PoolError::Other(anyhow::anyhow!(
        "task {} {} with code {}: {}",
        result.task_id,
        result.state,
        result.code,
        message
    ))
}
