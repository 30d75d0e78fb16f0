use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use procpool_api::{
    ErrorCode, PoolError, Result, TaskDesc, TaskId, TaskResult, TaskState, WorkerId, MAX_TASK_NAME_LEN,
};
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::allocator::TaskAllocator;
use crate::clock::now_ns;
use crate::ipc::ResultFrame;

/// Invoked once when a task reaches a terminal state, with the task id, the
/// state it left and the state it entered.
pub type FinishHook = Arc<dyn Fn(TaskId, TaskState, TaskState) + Send + Sync>;

/// Terminal outcome applied to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub state: TaskState,
    pub code: i32,
    pub message: Option<String>,
    pub output: Option<Vec<u8>>,
    pub start_ns: Option<u64>,
    pub end_ns: Option<u64>,
}

impl Outcome {
    pub fn completed(output: Vec<u8>) -> Self {
        Self::new(TaskState::Completed, 0, None).with_output(output)
    }

    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(TaskState::Failed, code.as_i32(), Some(message.into()))
    }

    pub fn timed_out(limit: Duration) -> Self {
        Self::new(
            TaskState::TimedOut,
            ErrorCode::Timeout.as_i32(),
            Some(format!("Task exceeded its timeout of {:?}", limit)),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(TaskState::Cancelled, 0, Some("Task cancelled".to_string()))
    }

    fn new(state: TaskState, code: i32, message: Option<String>) -> Self {
        Self { state, code, message, output: None, start_ns: None, end_ns: None }
    }

    fn with_output(mut self, output: Vec<u8>) -> Self {
        self.output = Some(output);
        self
    }
}

impl From<ResultFrame> for Outcome {
    fn from(frame: ResultFrame) -> Self {
        Self {
            state: frame.state,
            code: frame.code,
            message: frame.message,
            output: frame.output,
            start_ns: Some(frame.start_ns).filter(|ns| *ns != 0),
            end_ns: Some(frame.end_ns).filter(|ns| *ns != 0),
        }
    }
}

#[derive(Default)]
struct TaskRecord {
    worker_id: Option<WorkerId>,
    start_ns: u64,
    end_ns: u64,
    code: i32,
    message: Option<String>,
    output: Option<Vec<u8>>,
}

/// One unit of work, shared between the scheduler and every outstanding
/// [`TaskFuture`](super::TaskFuture).
///
/// State only moves forward. The first terminal transition wins; later
/// attempts (a late result after a timeout, a cancel racing a completion) are
/// ignored. Waiters block on a condition variable or, from async code, on a
/// [`Notify`].
pub struct Task {
    id: TaskId,
    desc: TaskDesc,
    input: Vec<u8>,
    submit_ns: u64,
    state: AtomicU8,
    record: Mutex<TaskRecord>,
    done: Condvar,
    notify: Notify,
    finish_hook: Option<FinishHook>,
    allocator: Weak<TaskAllocator>,
}

impl Task {
    /// Allocates a pending task holding a copy of `input`.
    pub fn create(
        allocator: &Arc<TaskAllocator>,
        mut desc: TaskDesc,
        input: &[u8],
        finish_hook: Option<FinishHook>,
    ) -> Result<Arc<Self>> {
        truncate_name(&mut desc.name);
        let input = allocator.copy_of(input)?;
        let task = Arc::new(Self {
            id: allocator.next_id(),
            desc,
            input,
            submit_ns: now_ns(),
            state: AtomicU8::new(TaskState::Pending as u8),
            record: Mutex::new(TaskRecord::default()),
            done: Condvar::new(),
            notify: Notify::new(),
            finish_hook,
            allocator: Arc::downgrade(allocator),
        });
        allocator.task_created();
        trace!("Created task {} ({})", task.id, task.desc.name);
        Ok(task)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn desc(&self) -> &TaskDesc {
        &self.desc
    }

    pub fn input(&self) -> &[u8] {
        &self.input
    }

    pub fn submit_ns(&self) -> u64 {
        self.submit_ns
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(TaskState::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.lock_record().worker_id
    }

    /// Monotonic timestamp at which the task started running, if it has.
    pub fn start_ns(&self) -> Option<u64> {
        Some(self.lock_record().start_ns).filter(|ns| *ns != 0)
    }

    /// Pending to Running on `worker_id`. Returns `false` if the task already
    /// left Pending (for example it was cancelled while queued).
    pub fn mark_running(&self, worker_id: WorkerId) -> bool {
        let mut record = self.lock_record();
        if self.state() != TaskState::Pending {
            return false;
        }
        record.worker_id = Some(worker_id);
        record.start_ns = now_ns();
        self.state.store(TaskState::Running as u8, Ordering::Release);
        true
    }

    /// Applies `outcome` if the task is not terminal yet.
    ///
    /// Wakes every waiter, then runs the finish hook and the completion
    /// callback outside the task lock. Returns whether this call made the
    /// transition.
    pub fn finish(&self, outcome: Outcome) -> bool {
        let (previous, result) = {
            let mut record = self.lock_record();
            let current = self.state();
            if !current.can_transition_to(outcome.state) {
                return false;
            }

            let end_ns = outcome.end_ns.unwrap_or_else(now_ns);
            if let Some(start_ns) = outcome.start_ns {
                record.start_ns = start_ns;
            }
            record.end_ns = end_ns;
            record.code = outcome.code;
            record.message = outcome.message;
            record.output = outcome.output;
            self.state.store(outcome.state as u8, Ordering::Release);
            (current, self.build_result(&record, outcome.state))
        };

        self.done.notify_all();
        self.notify.notify_waiters();
        debug!("Task {} finished: {} (code {})", self.id, result.state, result.code);

        if let Some(hook) = &self.finish_hook {
            hook(self.id, previous, result.state);
        }
        if let Some(callback) = &self.desc.callback {
            callback(&result);
        }
        true
    }

    /// Applies a result frame from the worker that ran this task.
    pub fn apply_frame(&self, frame: ResultFrame) -> bool {
        self.finish(Outcome::from(frame))
    }

    /// Cancels a pending or running task.
    ///
    /// A running task keeps executing on its worker until the worker notices
    /// the cancel hint; its eventual result is discarded.
    pub fn cancel(&self) -> Result<()> {
        let previous = self.state();
        if previous.is_terminal() {
            return Err(PoolError::InvalidParameter(format!(
                "task {} is already {}",
                self.id, previous
            )));
        }
        if !self.finish(Outcome::cancelled()) {
            return Err(PoolError::InvalidParameter(format!(
                "task {} is already {}",
                self.id,
                self.state()
            )));
        }
        Ok(())
    }

    /// Blocks until the task is terminal. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<TaskResult> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        let mut record = self.lock_record();
        loop {
            let state = self.state();
            if state.is_terminal() {
                return Ok(self.build_result(&record, state));
            }
            record = match deadline {
                None => self.done.wait(record).unwrap_or_else(PoisonError::into_inner),
                Some((at, limit)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(PoolError::Timeout(limit));
                    }
                    self.done
                        .wait_timeout(record, at - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Async counterpart of [`wait`](Self::wait).
    pub async fn wait_async(&self, timeout: Option<Duration>) -> Result<TaskResult> {
        let deadline = timeout.map(|t| (tokio::time::Instant::now() + t, t));
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_result() {
                return Ok(result);
            }
            match deadline {
                None => notified.await,
                Some((at, limit)) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        return self.try_result().ok_or(PoolError::Timeout(limit));
                    }
                }
            }
        }
    }

    /// The result if the task is terminal.
    pub fn try_result(&self) -> Option<TaskResult> {
        let record = self.lock_record();
        let state = self.state();
        state.is_terminal().then(|| self.build_result(&record, state))
    }

    fn build_result(&self, record: &TaskRecord, state: TaskState) -> TaskResult {
        TaskResult {
            task_id: self.id,
            state,
            code: record.code,
            message: record.message.clone(),
            output: record.output.clone(),
            worker_id: record.worker_id,
            submit_ns: self.submit_ns,
            start_ns: record.start_ns,
            end_ns: record.end_ns,
        }
    }

    fn lock_record(&self) -> MutexGuard<'_, TaskRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let Some(allocator) = self.allocator.upgrade() else {
            return;
        };
        allocator.recycle(mem::take(&mut self.input));
        let record = self.record.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(output) = record.output.take() {
            allocator.recycle(output);
        }
        allocator.task_released();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.desc.name)
            .field("state", &self.state())
            .field("input_len", &self.input.len())
            .finish()
    }
}

fn truncate_name(name: &mut String) {
    if name.len() <= MAX_TASK_NAME_LEN {
        return;
    }
    let mut end = MAX_TASK_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn task(allocator: &Arc<TaskAllocator>) -> Arc<Task> {
        Task::create(allocator, TaskDesc::new("unit"), b"input", None).unwrap()
    }

    #[test]
    fn test_first_terminal_transition_wins() {
        let allocator = Arc::new(TaskAllocator::new());
        let task = task(&allocator);
        assert!(task.mark_running(3));
        assert!(task.finish(Outcome::completed(b"out".to_vec())));
        assert!(!task.finish(Outcome::failed(ErrorCode::WorkerDead, "late")));

        let result = task.try_result().unwrap();
        assert_eq!(result.state, TaskState::Completed);
        assert_eq!(result.output_bytes(), b"out");
        assert_eq!(result.worker_id, Some(3));
        assert!(result.start_ns >= result.submit_ns);
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let allocator = Arc::new(TaskAllocator::new());
        let task = task(&allocator);
        assert!(!task.finish(Outcome::completed(Vec::new())));
        assert_eq!(task.state(), TaskState::Pending);
    }

    #[test]
    fn test_cancel_rules() {
        let allocator = Arc::new(TaskAllocator::new());
        let hooked = Arc::new(AtomicUsize::new(0));
        let hook: FinishHook = {
            let hooked = hooked.clone();
            Arc::new(move |_, previous, state| {
                assert_eq!(state, TaskState::Cancelled);
                if previous == TaskState::Running {
                    hooked.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let pending = Task::create(&allocator, TaskDesc::new("p"), b"", Some(hook.clone())).unwrap();
        pending.cancel().unwrap();
        assert_eq!(pending.state(), TaskState::Cancelled);
        assert_eq!(hooked.load(Ordering::SeqCst), 0);
        assert!(matches!(pending.cancel(), Err(PoolError::InvalidParameter(_))));

        let running = Task::create(&allocator, TaskDesc::new("r"), b"", Some(hook)).unwrap();
        running.mark_running(0);
        running.cancel().unwrap();
        assert_eq!(hooked.load(Ordering::SeqCst), 1);
        assert!(!running.mark_running(1));
    }

    #[test]
    fn test_wait_times_out_then_succeeds() {
        let allocator = Arc::new(TaskAllocator::new());
        let task = task(&allocator);
        task.mark_running(0);

        let err = task.wait(Some(Duration::from_millis(20))).unwrap_err();
        assert!(err.is_timeout());

        let finisher = {
            let task = task.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                task.finish(Outcome::completed(b"done".to_vec()));
            })
        };
        let result = task.wait(None).unwrap();
        assert_eq!(result.output_bytes(), b"done");
        finisher.join().unwrap();
    }

    #[test]
    fn test_callback_runs_once() {
        let allocator = Arc::new(TaskAllocator::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let desc = {
            let calls = calls.clone();
            TaskDesc::new("cb").with_callback(move |result| {
                assert_eq!(result.state, TaskState::Failed);
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let task = Task::create(&allocator, desc, b"", None).unwrap();
        task.finish(Outcome::failed(ErrorCode::ShutdownInProgress, "stopping"));
        task.finish(Outcome::cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_recycles_buffers() {
        let allocator = Arc::new(TaskAllocator::new());
        let task = task(&allocator);
        assert_eq!(allocator.stats().live_tasks, 1);
        drop(task);
        let stats = allocator.stats();
        assert_eq!(stats.live_tasks, 0);
        assert_eq!(stats.free_buffers, 1);
    }

    #[test]
    fn test_long_names_are_truncated() {
        let allocator = Arc::new(TaskAllocator::new());
        let task = Task::create(&allocator, TaskDesc::new("x".repeat(100)), b"", None).unwrap();
        assert_eq!(task.desc().name.len(), MAX_TASK_NAME_LEN);
    }

    #[tokio::test]
    async fn test_wait_async_sees_completion() {
        let allocator = Arc::new(TaskAllocator::new());
        let task = task(&allocator);
        task.mark_running(1);

        let err = task.wait_async(Some(Duration::from_millis(10))).await.unwrap_err();
        assert!(err.is_timeout());

        let finisher = task.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            finisher.finish(Outcome::completed(b"async".to_vec()));
        });
        let result = task.wait_async(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result.output_bytes(), b"async");
    }
}
