//! # Worker Supervisor
//!
//! Owns one worker execution context and everything needed to talk to it.
//!
//! ## Key Concepts
//! - Lifecycle: `Created -> Starting -> Running -> Stopping -> Stopped`, with
//!   `Error` reachable from any live state and `Error -> Created` on reset
//! - Monitoring: a monitor thread per worker receives result frames, checks
//!   process liveness and heartbeat age, and posts events to the event loop
//! - Shutdown: control word plus `Shutdown` frame first, forced termination
//!   after the stop timeout
//!
//! The monitor only holds a weak reference, so dropping the last
//! [`Arc<WorkerSupervisor>`] ends it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use procpool_api::{PoolError, Result, TaskId, WorkerId, WorkerInfo, WorkerState};
use tracing::{debug, error, trace, warn};

use super::runner::WorkerRuntime;
use super::transport::{WorkerHandle, WorkerTransport};
use crate::clock::{elapsed_since, now_ns};
use crate::event_loop::Event;
use crate::ipc::frame::{self, ControlOp, Frame, ResultFrame};
use crate::ipc::WorkerSegment;
use crate::{log_lifecycle, worker_span};
use crate::task::Task;

/// Longest single wait for a result frame inside the monitor.
const RECEIVE_POLL: Duration = Duration::from_millis(20);

/// Extra wait after a forced kill.
const FORCE_WAIT: Duration = Duration::from_secs(2);

const NO_TASK: u64 = 0;

/// Claimed by [`WorkerSupervisor::try_retire`]; no task is sent afterwards.
const RETIRING: u64 = u64::MAX;

/// Why a worker was declared dead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathCause {
    /// The process or thread exited; raw wait status when known.
    Exited(Option<i32>),
    /// No heartbeat for longer than twice the interval.
    HeartbeatTimeout(Duration),
    /// A task could not be written to the worker.
    SendFailed(String),
    /// Reading from the worker's channel failed.
    ReceiveFailed(String),
    /// Liveness could not be determined.
    CheckFailed(String),
}

impl fmt::Display for DeathCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(Some(status)) => write!(f, "exited with status {}", status),
            Self::Exited(None) => write!(f, "exited"),
            Self::HeartbeatTimeout(age) => write!(f, "no heartbeat for {:?}", age),
            Self::SendFailed(reason) => write!(f, "send failed: {}", reason),
            Self::ReceiveFailed(reason) => write!(f, "receive failed: {}", reason),
            Self::CheckFailed(reason) => write!(f, "liveness check failed: {}", reason),
        }
    }
}

/// Settings and collaborators shared by every supervisor of a pool.
#[derive(Debug)]
pub struct SupervisorContext {
    pub pool_name: String,
    pub transport: Arc<dyn WorkerTransport>,
    pub runtime: Arc<WorkerRuntime>,
    pub events: flume::Sender<Event>,
    pub heartbeat_interval: Duration,
    pub stop_timeout: Duration,
    /// Bound on writing one task frame into the worker's channel.
    pub send_timeout: Duration,
    pub slot_count: usize,
    pub slot_size: usize,
}

/// Supervises a single worker.
pub struct WorkerSupervisor {
    /// Slot id; a replacement keeps the id of the worker it replaces
    id: WorkerId,

    /// Distinguishes incarnations of the same slot in events
    generation: u64,

    restarts: u32,

    ctx: Arc<SupervisorContext>,

    state: AtomicU8,

    /// Created before the worker and dropped after it
    segment: WorkerSegment,

    handle: RwLock<Option<Arc<dyn WorkerHandle>>>,

    monitor: Mutex<Option<JoinHandle<()>>>,

    dead: AtomicBool,

    stopping: AtomicBool,

    /// Task assigned by the dispatcher, `NO_TASK` when idle, `RETIRING` once
    /// claimed for removal
    current_task: AtomicU64,

    /// Marked for removal; receives no new work
    draining: AtomicBool,

    idle_since_ns: AtomicU64,

    send_buf: Mutex<Vec<u8>>,
}

impl fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .field("current_task", &self.current_task())
            .field("dead", &self.dead.load(Ordering::Acquire))
            .finish()
    }
}

impl WorkerSupervisor {
    /// Allocates the worker's segment. The worker itself starts in [`start`](Self::start).
    pub fn create(ctx: Arc<SupervisorContext>, id: WorkerId, generation: u64, restarts: u32) -> Result<Arc<Self>> {
        let segment = ctx.transport.create_segment(&ctx.pool_name, id, ctx.slot_count, ctx.slot_size)?;
        trace!("[{}] Created segment for worker {}", ctx.pool_name, id);
        Ok(Arc::new(Self {
            id,
            generation,
            restarts,
            ctx,
            state: AtomicU8::new(WorkerState::Created as u8),
            segment,
            handle: RwLock::new(None),
            monitor: Mutex::new(None),
            dead: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            current_task: AtomicU64::new(NO_TASK),
            draining: AtomicBool::new(false),
            idle_since_ns: AtomicU64::new(now_ns()),
            send_buf: Mutex::new(Vec::new()),
        }))
    }

    /// Spawns the worker and its monitor. On failure the supervisor is left
    /// in `Error` and can be [`reset`](Self::reset).
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.transition(WorkerState::Created, WorkerState::Starting) {
            return Err(PoolError::InvalidParameter(format!(
                "worker {} cannot start from state {}",
                self.id,
                self.state()
            )));
        }

        let handle = match self.ctx.transport.spawn(self.ctx.runtime.clone(), self.segment.clone()) {
            Ok(handle) => handle,
            Err(err) => {
                self.set_state(WorkerState::Error);
                error!("[{}] Failed to spawn worker {}: {}", self.ctx.pool_name, self.id, err);
                return Err(err);
            }
        };
        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());

        let weak = Arc::downgrade(self);
        let events = self.ctx.events.clone();
        let interval = self.ctx.heartbeat_interval;
        let span = worker_span!(self.ctx.pool_name, self.id, generation = self.generation);
        let spawned = thread::Builder::new()
            .name(format!("{}-monitor-{}", self.ctx.pool_name, self.id))
            .spawn(move || span.in_scope(|| monitor_loop(weak, events, interval)));
        match spawned {
            Ok(monitor) => *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(monitor),
            Err(err) => {
                let _ = handle.terminate(true);
                let _ = handle.wait_exit(FORCE_WAIT);
                self.set_state(WorkerState::Error);
                return Err(PoolError::syscall(format!("spawn monitor for worker {}", self.id), err));
            }
        }

        self.idle_since_ns.store(now_ns(), Ordering::Release);
        self.transition(WorkerState::Starting, WorkerState::Running);
        log_lifecycle!(self.ctx.pool_name, self.id, "started", pid = ?handle.pid(), generation = self.generation);
        Ok(())
    }

    /// Claims the worker for `task` and writes it to the worker.
    ///
    /// Fails fast with `WorkerDead` if the worker is not running or has
    /// exited, and with `InvalidParameter` if it is busy or retiring. Any
    /// error means the dispatch did not happen.
    pub fn send_task(&self, task: &Task) -> Result<()> {
        let handle = self.live_handle()?;
        if !handle.check_alive()? {
            return Err(PoolError::WorkerDead { worker_id: self.id });
        }
        let claim = self
            .current_task
            .compare_exchange(NO_TASK, task.id(), Ordering::AcqRel, Ordering::Acquire);
        if let Err(claimed) = claim {
            let reason = if claimed == RETIRING { "retiring" } else { "busy" };
            return Err(PoolError::InvalidParameter(format!("worker {} is {}", self.id, reason)));
        }

        let mut buf = self.send_buf.lock().unwrap_or_else(PoisonError::into_inner);
        frame::encode_task(&mut buf, task.id(), task.submit_ns(), task.desc().handler.as_deref(), task.input());
        if let Err(err) = handle.send(&buf, self.ctx.send_timeout) {
            let _ = self
                .current_task
                .compare_exchange(task.id(), NO_TASK, Ordering::AcqRel, Ordering::Acquire);
            return Err(err);
        }
        trace!("[{}] Sent task {} to worker {}", self.ctx.pool_name, task.id(), self.id);
        Ok(())
    }

    /// Marks the worker draining and, once it has no task, claims it so no
    /// task can be sent anymore. Returns `true` when the worker is claimed.
    pub fn try_retire(&self) -> bool {
        self.set_draining();
        match self
            .current_task
            .compare_exchange(NO_TASK, RETIRING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == RETIRING,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.current_task.load(Ordering::Acquire) == RETIRING
    }

    /// Next result frame, or `None` if nothing arrived within `timeout`.
    pub fn receive_result(&self, timeout: Duration) -> Result<Option<ResultFrame>> {
        let handle = self.live_handle()?;
        let mut buf = Vec::new();
        self.receive_with(&*handle, &mut buf, timeout)
    }

    fn receive_with(&self, handle: &dyn WorkerHandle, buf: &mut Vec<u8>, timeout: Duration) -> Result<Option<ResultFrame>> {
        if !handle.receive(buf, timeout)? {
            return Ok(None);
        }
        match frame::decode(buf)? {
            Frame::Result(result) => Ok(Some(result)),
            other => {
                warn!("[{}] Worker {} sent an unexpected frame: {:?}", self.ctx.pool_name, self.id, other);
                Ok(None)
            }
        }
    }

    /// Result frames already written by the worker, collected without waiting.
    /// Used after a death to keep work the worker finished.
    pub fn drain_results(&self) -> Vec<ResultFrame> {
        let mut results = Vec::new();
        let mut buf = Vec::new();
        while let Ok(true) = self.segment.results().dequeue_into(&mut buf, Duration::ZERO) {
            if let Ok(Frame::Result(result)) = frame::decode(&buf) {
                results.push(result);
            }
        }
        results
    }

    /// Checks process existence and heartbeat age.
    pub fn health_check(&self) -> Option<DeathCause> {
        let handle = self.handle()?;
        match handle.check_alive() {
            Ok(true) => {}
            Ok(false) => return Some(DeathCause::Exited(None)),
            Err(err) => return Some(DeathCause::CheckFailed(err.to_string())),
        }

        let age = elapsed_since(self.segment.heartbeat_ns());
        if age > self.ctx.heartbeat_interval * 2 {
            return Some(DeathCause::HeartbeatTimeout(age));
        }
        None
    }

    /// Records the worker as dead. Returns `true` for the call that did it.
    pub fn mark_dead(&self, cause: &DeathCause) -> bool {
        if self.dead.swap(true, Ordering::AcqRel) {
            return false;
        }
        let previous = self.state();
        if previous.can_transition_to(WorkerState::Error) {
            self.set_state(WorkerState::Error);
        }
        warn!("[{}] Worker {} is dead: {}", self.ctx.pool_name, self.id, cause);
        true
    }

    /// Stops the worker: graceful request first, then forced termination
    /// after `timeout`. Idempotent.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        let state = self.state();
        if self.stopping.swap(true, Ordering::AcqRel) && state != WorkerState::Stopping {
            self.join_monitor();
            return Ok(());
        }
        if state == WorkerState::Running {
            self.transition(WorkerState::Running, WorkerState::Stopping);
        }

        if let Some(handle) = self.handle() {
            self.segment.request_shutdown();
            let mut buf = Vec::new();
            frame::encode_control(&mut buf, ControlOp::Shutdown);
            let _ = handle.send(&buf, Duration::ZERO);

            if !handle.wait_exit(timeout).unwrap_or(false) {
                warn!(
                    "[{}] Worker {} did not exit within {:?}; terminating",
                    self.ctx.pool_name, self.id, timeout
                );
                handle.terminate(true)?;
                if !handle.wait_exit(FORCE_WAIT)? {
                    error!("[{}] Worker {} survived forced termination", self.ctx.pool_name, self.id);
                }
            }
        }

        self.segment.close();
        self.join_monitor();
        if self.transition(WorkerState::Stopping, WorkerState::Stopped) {
            log_lifecycle!(self.ctx.pool_name, self.id, "stopped");
        } else {
            debug!("[{}] Worker {} cleaned up in state {}", self.ctx.pool_name, self.id, self.state());
        }
        Ok(())
    }

    /// [`stop`](Self::stop) with the pool's configured stop timeout.
    pub fn shutdown(&self) -> Result<()> {
        self.stop(self.ctx.stop_timeout)
    }

    /// Returns a supervisor whose start failed to `Created` so it can be
    /// started again.
    pub fn reset(&self) -> Result<()> {
        if self.state() != WorkerState::Error {
            return Err(PoolError::InvalidParameter(format!(
                "worker {} can only be reset from error, not {}",
                self.id,
                self.state()
            )));
        }
        if self.segment.tasks().is_closed() {
            return Err(PoolError::InvalidParameter(format!("worker {} was already stopped", self.id)));
        }

        if let Some(handle) = self.handle.write().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = handle.terminate(true);
            let _ = handle.wait_exit(FORCE_WAIT);
        }
        self.join_monitor();
        while let Ok(true) = self.segment.tasks().dequeue_into(&mut Vec::new(), Duration::ZERO) {}
        while let Ok(true) = self.segment.results().dequeue_into(&mut Vec::new(), Duration::ZERO) {}

        self.dead.store(false, Ordering::Release);
        self.stopping.store(false, Ordering::Release);
        self.current_task.store(NO_TASK, Ordering::Release);
        self.segment.touch_heartbeat();
        self.transition(WorkerState::Error, WorkerState::Created);
        Ok(())
    }

    /// Asks the worker to skip `task_id` if it has not started it yet.
    pub fn post_cancel(&self, task_id: TaskId) {
        self.segment.post_cancel(task_id);
    }

    /// Clears the current task once its result has been applied.
    pub fn task_finished(&self) {
        let current = self.current_task.load(Ordering::Acquire);
        if current != RETIRING {
            let _ = self
                .current_task
                .compare_exchange(current, NO_TASK, Ordering::AcqRel, Ordering::Acquire);
        }
        self.idle_since_ns.store(now_ns(), Ordering::Release);
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(WorkerState::Error)
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle().and_then(|h| h.pid())
    }

    pub fn current_task(&self) -> Option<TaskId> {
        Some(self.current_task.load(Ordering::Acquire)).filter(|id| *id != NO_TASK && *id != RETIRING)
    }

    /// Running and not declared dead.
    pub fn is_alive(&self) -> bool {
        self.state() == WorkerState::Running && !self.dead.load(Ordering::Acquire)
    }

    /// Alive, not draining and without a task.
    pub fn is_idle(&self) -> bool {
        self.is_alive() && !self.is_draining() && self.current_task.load(Ordering::Acquire) == NO_TASK
    }

    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// How long the worker has been without a task; zero while busy.
    pub fn idle_for(&self) -> Duration {
        if self.current_task.load(Ordering::Acquire) != NO_TASK {
            return Duration::ZERO;
        }
        elapsed_since(self.idle_since_ns.load(Ordering::Acquire))
    }

    pub fn segment(&self) -> &WorkerSegment {
        &self.segment
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            worker_id: self.id,
            pid: self.pid(),
            state: self.state(),
            tasks_processed: self.segment.tasks_processed(),
            last_heartbeat_ns: self.segment.heartbeat_ns(),
            current_task_id: self.current_task(),
            restarts: self.restarts,
        }
    }

    fn handle(&self) -> Option<Arc<dyn WorkerHandle>> {
        self.handle.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn live_handle(&self) -> Result<Arc<dyn WorkerHandle>> {
        if !self.is_alive() {
            return Err(PoolError::WorkerDead { worker_id: self.id });
        }
        self.handle().ok_or(PoolError::WorkerDead { worker_id: self.id })
    }

    fn ping(&self) {
        if !self.segment.tasks().is_empty() {
            return;
        }
        if let Some(handle) = self.handle() {
            let mut buf = Vec::new();
            frame::encode_control(&mut buf, ControlOp::Ping);
            let _ = handle.send(&buf, Duration::ZERO);
        }
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> bool {
        debug_assert!(from.can_transition_to(to));
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn join_monitor(&self) {
        let monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(monitor) = monitor {
            if monitor.thread().id() == thread::current().id() {
                return;
            }
            if monitor.join().is_err() {
                error!("[{}] Monitor of worker {} panicked", self.ctx.pool_name, self.id);
            }
        }
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        self.segment.close();
        if let Some(handle) = self.handle.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            if handle.check_alive().unwrap_or(false) {
                let _ = handle.terminate(true);
                let _ = handle.wait_exit(FORCE_WAIT);
            }
        }
    }
}

fn monitor_loop(weak: Weak<WorkerSupervisor>, events: flume::Sender<Event>, interval: Duration) {
    let mut buf = Vec::new();
    let mut next_ping = Instant::now() + interval;

    loop {
        let Some(supervisor) = weak.upgrade() else {
            return;
        };
        if supervisor.stopping.load(Ordering::Acquire) || supervisor.dead.load(Ordering::Acquire) {
            return;
        }
        let Some(handle) = supervisor.handle() else {
            return;
        };

        match supervisor.receive_with(&*handle, &mut buf, RECEIVE_POLL) {
            Ok(Some(result)) => {
                let event = Event::ResultReady {
                    worker_id: supervisor.id,
                    generation: supervisor.generation,
                    result,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(err) => {
                if !supervisor.stopping.load(Ordering::Acquire) {
                    report_death(&supervisor, &events, DeathCause::ReceiveFailed(err.to_string()));
                }
                return;
            }
        }

        if let Some(cause) = supervisor.health_check() {
            if !supervisor.stopping.load(Ordering::Acquire) {
                report_death(&supervisor, &events, cause);
            }
            return;
        }

        if Instant::now() >= next_ping {
            supervisor.ping();
            next_ping = Instant::now() + interval;
        }
    }
}

fn report_death(supervisor: &WorkerSupervisor, events: &flume::Sender<Event>, cause: DeathCause) {
    if supervisor.mark_dead(&cause) {
        let _ = events.send(Event::WorkerStatus {
            worker_id: supervisor.id,
            generation: supervisor.generation,
            cause,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::handler::{handler_fn, HandlerRegistry};
    use crate::task::TaskAllocator;
    use crate::worker::transport_for;
    use procpool_api::{TaskDesc, TaskState};

    fn context(events: flume::Sender<Event>) -> Arc<SupervisorContext> {
        let mut handlers = HandlerRegistry::default();
        handlers.register(
            "sleep",
            handler_fn(|_, _| {
                thread::sleep(Duration::from_secs(30));
                Ok(Vec::new())
            }),
        );
        Arc::new(SupervisorContext {
            pool_name: "supervisor-unit".to_string(),
            transport: transport_for(TransportKind::Thread),
            runtime: Arc::new(WorkerRuntime {
                pool_name: "supervisor-unit".to_string(),
                handlers,
                user_context: None,
                heartbeat_interval: Duration::from_millis(100),
            }),
            events,
            heartbeat_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_millis(200),
            send_timeout: Duration::from_millis(100),
            slot_count: 4,
            slot_size: 1024,
        })
    }

    fn process_context(events: flume::Sender<Event>) -> Arc<SupervisorContext> {
        let base = context(events);
        let pool_name = format!("supervisor-{}", &uuid::Uuid::new_v4().simple().to_string()[..10]);
        Arc::new(SupervisorContext {
            pool_name: pool_name.clone(),
            transport: transport_for(TransportKind::Process),
            runtime: Arc::new(WorkerRuntime { pool_name, ..(*base.runtime).clone() }),
            events: base.events.clone(),
            heartbeat_interval: base.heartbeat_interval,
            stop_timeout: base.stop_timeout,
            send_timeout: base.send_timeout,
            slot_count: base.slot_count,
            slot_size: base.slot_size,
        })
    }

    #[test]
    fn test_lifecycle_and_result_event() {
        let (tx, rx) = flume::unbounded();
        let supervisor = WorkerSupervisor::create(context(tx), 0, 1, 0).unwrap();
        assert_eq!(supervisor.state(), WorkerState::Created);
        assert!(matches!(supervisor.send_task(&dummy_task(None)), Err(PoolError::WorkerDead { .. })));

        supervisor.start().unwrap();
        assert_eq!(supervisor.state(), WorkerState::Running);
        assert!(supervisor.is_idle());
        assert!(supervisor.start().is_err());

        let task = dummy_task(None);
        supervisor.send_task(&task).unwrap();
        assert_eq!(supervisor.current_task(), Some(task.id()));
        assert!(!supervisor.is_idle());

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::ResultReady { worker_id, generation, result } => {
                assert_eq!((worker_id, generation), (0, 1));
                assert_eq!(result.task_id, task.id());
                assert_eq!(result.state, TaskState::Completed);
            }
            other => panic!("unexpected event {}", other),
        }
        supervisor.task_finished();
        assert!(supervisor.is_idle());

        supervisor.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(supervisor.state(), WorkerState::Stopped);
        supervisor.stop(Duration::from_secs(1)).unwrap();
        assert!(matches!(supervisor.receive_result(Duration::ZERO), Err(PoolError::WorkerDead { .. })));
    }

    #[test]
    fn test_stop_escalates_for_busy_worker() {
        let (tx, _rx) = flume::unbounded();
        let supervisor = WorkerSupervisor::create(context(tx), 1, 1, 0).unwrap();
        supervisor.start().unwrap();
        supervisor.send_task(&dummy_task(Some("sleep"))).unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        supervisor.stop(Duration::from_millis(100)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_retired_worker_refuses_tasks() {
        let (tx, _rx) = flume::unbounded();
        let supervisor = WorkerSupervisor::create(context(tx), 3, 1, 0).unwrap();
        supervisor.start().unwrap();

        assert!(supervisor.try_retire());
        assert!(supervisor.try_retire());
        assert!(supervisor.is_retired());
        assert!(!supervisor.is_idle());
        assert_eq!(supervisor.current_task(), None);

        let err = supervisor.send_task(&dummy_task(None)).unwrap_err();
        assert!(matches!(err, PoolError::InvalidParameter(ref msg) if msg.contains("retiring")));
        assert!(supervisor.is_alive());
        assert!(supervisor.segment().tasks().is_empty());
        supervisor.shutdown().unwrap();
    }

    #[test]
    fn test_busy_worker_cannot_be_retired() {
        let (tx, _rx) = flume::unbounded();
        let supervisor = WorkerSupervisor::create(context(tx), 4, 1, 0).unwrap();
        supervisor.start().unwrap();

        let task = dummy_task(Some("sleep"));
        supervisor.send_task(&task).unwrap();
        assert!(!supervisor.try_retire());
        assert!(supervisor.is_draining());
        assert_eq!(supervisor.current_task(), Some(task.id()));
        assert!(supervisor.send_task(&dummy_task(None)).is_err());

        supervisor.task_finished();
        assert!(supervisor.try_retire());
        supervisor.stop(Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn test_dropping_old_supervisor_keeps_replacement() {
        let (tx, rx) = flume::unbounded();
        let ctx = process_context(tx);
        let old = WorkerSupervisor::create(ctx.clone(), 5, 1, 0).unwrap();
        old.start().unwrap();
        let replacement = WorkerSupervisor::create(ctx, 5, 2, 1).unwrap();
        replacement.start().unwrap();

        old.stop(Duration::from_millis(200)).unwrap();
        drop(old);
        assert!(replacement.is_alive());

        let task = dummy_task(None);
        replacement.send_task(&task).unwrap();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::ResultReady { generation, result, .. } => {
                assert_eq!(generation, 2);
                assert_eq!(result.task_id, task.id());
            }
            other => panic!("unexpected event {}", other),
        }
        replacement.shutdown().unwrap();
    }

    #[test]
    fn test_mark_dead_reports_once() {
        let (tx, _rx) = flume::unbounded();
        let supervisor = WorkerSupervisor::create(context(tx), 2, 1, 0).unwrap();
        supervisor.start().unwrap();
        let cause = DeathCause::SendFailed("test".to_string());
        assert!(supervisor.mark_dead(&cause));
        assert!(!supervisor.mark_dead(&cause));
        assert_eq!(supervisor.state(), WorkerState::Error);
        assert!(!supervisor.is_alive());
        assert_eq!(supervisor.info().state, WorkerState::Error);

        supervisor.reset().unwrap();
        assert_eq!(supervisor.state(), WorkerState::Created);
        supervisor.start().unwrap();
        assert!(supervisor.is_alive());
        supervisor.shutdown().unwrap();
    }

    fn dummy_task(handler: Option<&str>) -> Arc<Task> {
        let allocator = Arc::new(TaskAllocator::new());
        let mut desc = TaskDesc::new("unit");
        desc.handler = handler.map(str::to_string);
        Task::create(&allocator, desc, b"payload", None).unwrap()
    }
}
