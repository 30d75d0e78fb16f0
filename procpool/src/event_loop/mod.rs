//! # Event Loop
//!
//! The single coordination thread of a pool. It owns the consumer side of the
//! pending-task ring and the receiving end of the event channel, and is the
//! only place tasks are dispatched to workers.
//!
//! ## Key Concepts
//! - Dispatch: pending tasks go to the idle worker with the lowest id; with no
//!   idle worker they stay queued
//! - Results: frames posted by worker monitors are applied to their tasks
//! - Recovery: a dead worker's in-flight task fails with `WorkerDead` and the
//!   slot is refilled within the restart policy's budget
//! - Tick: once per [`TIMER_INTERVAL`], liveness sweep, task expiry, pending
//!   restarts and auto-scaling
//!
//! Worker set changes (restarts, auto-scaling) only happen when the topology
//! lock is free; otherwise they wait for the next iteration.

pub mod event;
pub mod scaling;
pub mod signals;

pub use event::{ControlCommand, Event, PoolSignal};
pub use scaling::{decide, ScaleDecision, ScaleInput};
pub use signals::SignalBridge;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::RecvTimeoutError;
use procpool_api::{ErrorCode, PoolState, TaskId, TaskState, WorkerId, WorkerState};
use tracing::{debug, error, info, trace, warn};

use crate::clock::{elapsed_since, now_ns};
use crate::config::TIMER_INTERVAL;
use crate::ipc::ResultFrame;
use crate::log_lifecycle;
use crate::pool::metrics::Metric;
use crate::pool::shared::PoolShared;
use crate::pool_span;
use crate::queue::RingConsumer;
use crate::task::{Outcome, Task};
use crate::worker::{DeathCause, WorkerSupervisor};

/// Longest wait for events while draining after a termination signal.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// The parts of a pool an event loop runs on. Handed back when the loop
/// returns so a failed start can be retried.
pub struct LoopParts {
    pub consumer: RingConsumer<Arc<Task>>,
    pub events: flume::Receiver<Event>,
}

struct InFlight {
    task: Arc<Task>,
    worker_id: WorkerId,
    generation: u64,
}

/// A slot waiting to be refilled. `generation` is the dead worker still in
/// the slot, or `None` once the slot is empty.
#[derive(Debug, Clone, Copy)]
struct PendingRestart {
    generation: Option<u64>,
    restarts: u32,
}

pub struct EventLoop {
    shared: Arc<PoolShared>,
    consumer: RingConsumer<Arc<Task>>,
    events: flume::Receiver<Event>,

    /// Tasks taken from the ring that go out before anything still in it
    held: VecDeque<Arc<Task>>,

    in_flight: HashMap<TaskId, InFlight>,

    restart_history: HashMap<WorkerId, VecDeque<Instant>>,
    pending_restarts: BTreeMap<WorkerId, PendingRestart>,

    running: bool,
    stopped_by_signal: bool,

    /// Set by a termination signal; the loop keeps dispatching until every
    /// admitted task has finished or this passes
    drain_deadline: Option<Instant>,
}

impl EventLoop {
    pub fn new(shared: Arc<PoolShared>, parts: LoopParts) -> Self {
        Self {
            shared,
            consumer: parts.consumer,
            events: parts.events,
            held: VecDeque::new(),
            in_flight: HashMap::new(),
            restart_history: HashMap::new(),
            pending_restarts: BTreeMap::new(),
            running: false,
            stopped_by_signal: false,
            drain_deadline: None,
        }
    }

    /// Runs until a `Stop` command, or until a termination signal has been
    /// followed by a drain bounded by the stop timeout.
    ///
    /// Tasks still queued or in flight on exit fail with
    /// `ShutdownInProgress`.
    pub fn run(mut self) -> LoopParts {
        let span = pool_span!(self.shared.name);
        let _enter = span.enter();
        info!("[{}] Event loop started", self.shared.name);

        self.running = true;
        let mut next_tick = Instant::now() + TIMER_INTERVAL;
        while self.running {
            let mut wait = next_tick.saturating_duration_since(Instant::now());
            if self.drain_deadline.is_some() {
                wait = wait.min(DRAIN_POLL);
            }
            match self.events.recv_timeout(wait) {
                Ok(event) => {
                    self.handle_event(event);
                    while self.running {
                        let Ok(event) = self.events.try_recv() else {
                            break;
                        };
                        self.handle_event(event);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.running = false,
            }

            if Instant::now() >= next_tick {
                self.tick();
                next_tick = Instant::now() + TIMER_INTERVAL;
            }
            if self.running {
                self.dispatch();
            }
            self.publish();
            self.check_drained();
        }

        self.fail_remaining();
        if self.stopped_by_signal {
            self.shared.workers.stop_all(self.shared.config.stop_timeout);
            self.shared.set_state(PoolState::Stopped);
        }
        info!(
            "[{}] Event loop stopped after {} events and {} ticks",
            self.shared.name,
            self.shared.events_processed(),
            self.shared.timer_ticks()
        );
        LoopParts { consumer: self.consumer, events: self.events }
    }

    fn handle_event(&mut self, event: Event) {
        self.shared.count_event();
        trace!("[{}] Event {}", self.shared.name, event);
        match event {
            // Dispatch runs after every batch of events
            Event::TaskSubmitted => {}
            Event::WorkersChanged => self.fail_orphaned(),
            Event::TaskCancelled(task_id) => self.on_cancelled(task_id),
            Event::ResultReady { worker_id, generation, result } => self.on_result(worker_id, generation, result),
            Event::WorkerStatus { worker_id, generation, cause } => {
                match self.shared.workers.get(worker_id).filter(|w| w.generation() == generation) {
                    Some(worker) => self.worker_died(&worker, &cause),
                    None => debug!("[{}] Ignoring stale status of worker {}: {}", self.shared.name, worker_id, cause),
                }
            }
            Event::Signal(signal) => self.on_signal(signal),
            Event::Control(command) => self.on_control(command),
        }
    }

    // --- Dispatch ---

    fn dispatch(&mut self) {
        loop {
            let Some(worker) = self.shared.workers.first_idle() else {
                return;
            };
            let Some(task) = self.next_task() else {
                return;
            };
            if task.state() != TaskState::Pending {
                trace!("[{}] Dropping task {} ({})", self.shared.name, task.id(), task.state());
                continue;
            }

            match worker.send_task(&task) {
                Ok(()) => {
                    if !task.mark_running(worker.id()) {
                        // Cancelled between the state check and the send
                        worker.post_cancel(task.id());
                        continue;
                    }
                    self.shared
                        .metrics
                        .record(Metric::QueueTime, now_ns().saturating_sub(task.submit_ns()));
                    debug!(
                        "[{}] Dispatched task {} to worker {}{}",
                        self.shared.name,
                        task.id(),
                        worker.id(),
                        trace_suffix(&task)
                    );
                    self.in_flight.insert(
                        task.id(),
                        InFlight { task, worker_id: worker.id(), generation: worker.generation() },
                    );
                }
                Err(err) if worker.is_draining() => {
                    trace!(
                        "[{}] Worker {} is retiring, keeping task {} first in line: {}",
                        self.shared.name,
                        worker.id(),
                        task.id(),
                        err
                    );
                    self.held.push_front(task);
                }
                Err(err) => {
                    warn!(
                        "[{}] Dispatch of task {} to worker {} failed: {}",
                        self.shared.name,
                        task.id(),
                        worker.id(),
                        err
                    );
                    let cause = DeathCause::SendFailed(err.to_string());
                    if worker.mark_dead(&cause) {
                        self.worker_died(&worker, &cause);
                    }
                    self.requeue(task);
                }
            }
        }
    }

    fn next_task(&mut self) -> Option<Arc<Task>> {
        self.held.pop_front().or_else(|| self.consumer.dequeue())
    }

    /// Puts `task` back at the tail of the admission queue.
    fn requeue(&mut self, task: Arc<Task>) {
        if let Err(task) = self.shared.admission.submit(task) {
            self.held.push_back(task);
        }
    }

    // --- Results ---

    fn on_result(&mut self, worker_id: WorkerId, generation: u64, result: ResultFrame) {
        if let Some(worker) = self.shared.workers.get(worker_id).filter(|w| w.generation() == generation) {
            if worker.current_task() == Some(result.task_id) {
                worker.task_finished();
            }
        }
        self.apply_result(result);
    }

    fn apply_result(&mut self, result: ResultFrame) {
        let Some(entry) = self.in_flight.remove(&result.task_id) else {
            trace!("[{}] Discarding result of task {}", self.shared.name, result.task_id);
            return;
        };

        let state = result.state;
        let execution_ns = result.end_ns.saturating_sub(result.start_ns);
        if entry.task.apply_frame(result) {
            self.record_outcome(state, execution_ns);
        }
    }

    fn record_outcome(&self, state: TaskState, execution_ns: u64) {
        let metrics = &self.shared.metrics;
        match state {
            TaskState::Completed => {
                metrics.record(Metric::TaskCompleted, 1);
                metrics.record(Metric::ExecutionTime, execution_ns);
            }
            TaskState::Failed => {
                metrics.record(Metric::TaskFailed, 1);
                metrics.record(Metric::ExecutionTime, execution_ns);
            }
            TaskState::TimedOut => metrics.record(Metric::TaskTimedOut, 1),
            // Cancellations are counted when the caller cancels
            TaskState::Cancelled | TaskState::Pending | TaskState::Running => {}
        }
    }

    fn on_cancelled(&mut self, task_id: TaskId) {
        let Some(entry) = self.in_flight.remove(&task_id) else {
            return;
        };
        if let Some(worker) = self.shared.workers.get(entry.worker_id).filter(|w| w.generation() == entry.generation) {
            worker.post_cancel(task_id);
        }
        debug!("[{}] Cancelled running task {} on worker {}", self.shared.name, task_id, entry.worker_id);
    }

    // --- Worker death and restarts ---

    fn worker_died(&mut self, worker: &Arc<WorkerSupervisor>, cause: &DeathCause) {
        let id = worker.id();
        log_lifecycle!(self.shared.name, id, "died", cause = %cause, generation = worker.generation());

        for result in worker.drain_results() {
            self.apply_result(result);
        }

        let lost: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.worker_id == id && entry.generation == worker.generation())
            .map(|(task_id, _)| *task_id)
            .collect();
        for task_id in lost {
            if let Some(entry) = self.in_flight.remove(&task_id) {
                let outcome = Outcome::failed(ErrorCode::WorkerDead, format!("Worker {} died: {}", id, cause));
                if entry.task.finish(outcome) {
                    self.shared.metrics.record(Metric::TaskFailed, 1);
                }
            }
        }

        if worker.is_draining() || matches!(self.shared.state(), PoolState::Stopping | PoolState::Stopped) {
            return;
        }
        self.pending_restarts.insert(
            id,
            PendingRestart { generation: Some(worker.generation()), restarts: worker.restarts() + 1 },
        );
        self.process_restarts();
    }

    /// Fails in-flight tasks whose worker left the set without reporting,
    /// e.g. one retired by a resize while still busy.
    fn fail_orphaned(&mut self) {
        let orphaned: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| {
                !self
                    .shared
                    .workers
                    .get(entry.worker_id)
                    .is_some_and(|w| w.generation() == entry.generation)
            })
            .map(|(task_id, _)| *task_id)
            .collect();

        for task_id in orphaned {
            if let Some(entry) = self.in_flight.remove(&task_id) {
                warn!(
                    "[{}] Worker {} was removed while running task {}",
                    self.shared.name, entry.worker_id, task_id
                );
                let message = format!("Worker {} was removed before finishing the task", entry.worker_id);
                if entry.task.finish(Outcome::failed(ErrorCode::WorkerDead, message)) {
                    self.shared.metrics.record(Metric::TaskFailed, 1);
                }
            }
        }
    }

    fn process_restarts(&mut self) {
        if self.pending_restarts.is_empty() || self.shared.state() != PoolState::Running {
            return;
        }
        let shared = self.shared.clone();
        let Some(topology) = shared.workers.try_lock_topology() else {
            return;
        };

        for (id, pending) in mem::take(&mut self.pending_restarts) {
            match (pending.generation, shared.workers.get(id)) {
                (Some(generation), Some(old)) if old.generation() == generation => {
                    shared.workers.remove(&topology, id);
                    if let Err(err) = old.stop(Duration::ZERO) {
                        warn!("[{}] Failed to clean up dead worker {}: {}", shared.name, id, err);
                    }
                }
                (None, None) => {}
                // The slot was changed by someone else
                _ => continue,
            }

            if shared.workers.count() >= shared.target_workers() {
                debug!("[{}] Not replacing worker {}: pool is at its target size", shared.name, id);
                continue;
            }
            if !self.restart_allowed(id) {
                error!(
                    "[{}] Worker {} exhausted its restart budget ({} within {:?}); pool is degraded",
                    shared.name,
                    id,
                    shared.config.restart_policy.max_retries,
                    shared.config.restart_policy.within
                );
                shared.set_degraded(true);
                continue;
            }

            match shared.workers.spawn(&topology, id, pending.restarts) {
                Ok(worker) => {
                    shared.metrics.record(Metric::WorkerRestarted, 1);
                    log_lifecycle!(shared.name, id, "restarted", restarts = pending.restarts, pid = ?worker.pid());
                }
                Err(err) => {
                    warn!("[{}] Restart of worker {} failed: {}", shared.name, id, err);
                    self.pending_restarts
                        .insert(id, PendingRestart { generation: None, restarts: pending.restarts });
                }
            }
        }
    }

    /// Records a restart attempt for slot `id` if the policy allows one more.
    fn restart_allowed(&mut self, id: WorkerId) -> bool {
        let policy = &self.shared.config.restart_policy;
        let now = Instant::now();
        let history = self.restart_history.entry(id).or_default();
        while history.front().is_some_and(|at| now.duration_since(*at) > policy.within) {
            history.pop_front();
        }
        if history.len() >= policy.max_retries {
            return false;
        }
        history.push_back(now);
        true
    }

    // --- Timer ---

    fn tick(&mut self) {
        self.shared.count_tick();
        self.sweep_liveness();
        self.fail_orphaned();
        self.expire_tasks();
        self.process_restarts();
        if self.shared.auto_scaling() {
            self.autoscale();
        }
        if self.shared.is_degraded() && self.shared.workers.live_count() >= self.shared.target_workers() {
            info!("[{}] Pool recovered its target size", self.shared.name);
            self.shared.set_degraded(false);
        }

        self.publish();
        if self.shared.debug_mode() {
            debug!("[{}] {:?}", self.shared.name, self.shared.snapshot());
        }
    }

    fn sweep_liveness(&mut self) {
        for worker in self.shared.workers.all() {
            if !worker.is_alive() {
                continue;
            }
            if let Some(cause) = worker.health_check() {
                if worker.mark_dead(&cause) {
                    self.worker_died(&worker, &cause);
                }
            }
        }
    }

    /// Times out running tasks older than the task timeout. The worker stays
    /// busy until it reports; that late result is discarded.
    fn expire_tasks(&mut self) {
        let limit = self.shared.task_timeout();
        if limit.is_zero() {
            return;
        }
        let expired: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.task.start_ns().is_some_and(|start| elapsed_since(start) > limit))
            .map(|(task_id, _)| *task_id)
            .collect();

        for task_id in expired {
            if let Some(entry) = self.in_flight.remove(&task_id) {
                warn!(
                    "[{}] Task {} on worker {} exceeded {:?}",
                    self.shared.name, task_id, entry.worker_id, limit
                );
                if entry.task.finish(Outcome::timed_out(limit)) {
                    self.shared.metrics.record(Metric::TaskTimedOut, 1);
                }
            }
        }
    }

    fn autoscale(&mut self) {
        let Some(topology) = self.shared.workers.try_lock_topology() else {
            return;
        };
        let workers = self.shared.workers.all();
        let input = ScaleInput {
            queued: self.shared.admission.len() + self.held.len(),
            live: workers.iter().filter(|w| w.is_alive()).count(),
            min_workers: self.shared.config.min_workers,
            max_workers: self.shared.config.max_workers,
            idle_timeout: self.shared.idle_timeout(),
            idle: workers.iter().filter(|w| w.is_idle()).map(|w| (w.id(), w.idle_for())).collect(),
        };

        match decide(&input) {
            ScaleDecision::Grow => {
                let Some(id) = self.shared.workers.free_id() else {
                    return;
                };
                match self.shared.workers.spawn(&topology, id, 0) {
                    Ok(_) => {
                        let count = self.shared.workers.count();
                        self.shared.set_target_workers(count.max(self.shared.target_workers()));
                        info!("[{}] Scaled up to {} workers ({} queued)", self.shared.name, count, input.queued);
                    }
                    Err(err) => warn!("[{}] Scale-up failed: {}", self.shared.name, err),
                }
            }
            ScaleDecision::Shrink(id) => {
                if !self.shared.workers.get(id).is_some_and(|w| w.try_retire()) {
                    return;
                }
                if let Some(worker) = self.shared.workers.remove(&topology, id) {
                    if let Err(err) = worker.shutdown() {
                        warn!("[{}] Failed to stop idle worker {}: {}", self.shared.name, id, err);
                    }
                    let count = self.shared.workers.count();
                    self.shared.set_target_workers(count.max(self.shared.config.min_workers));
                    info!("[{}] Scaled down to {} workers", self.shared.name, count);
                }
            }
            ScaleDecision::Hold => {}
        }
    }

    // --- Signals and control ---

    fn on_signal(&mut self, signal: PoolSignal) {
        match signal {
            PoolSignal::Terminate | PoolSignal::Interrupt => {
                if self.shared.transition(PoolState::Running, PoolState::Stopping) {
                    let timeout = self.shared.config.stop_timeout;
                    info!(
                        "[{}] {:?} received; draining {} tasks for up to {:?}",
                        self.shared.name,
                        signal,
                        self.shared.outstanding_tasks(),
                        timeout
                    );
                    self.stopped_by_signal = true;
                    self.drain_deadline = Some(Instant::now() + timeout);
                }
            }
            PoolSignal::ChildExited => self.sweep_liveness(),
            PoolSignal::DumpStats => match serde_json::to_string(&self.shared.snapshot()) {
                Ok(json) => info!("[{}] stats {}", self.shared.name, json),
                Err(err) => warn!("[{}] Failed to serialize stats: {}", self.shared.name, err),
            },
            PoolSignal::ToggleDebug => {
                let enabled = self.shared.toggle_debug_mode();
                info!("[{}] Debug mode {}", self.shared.name, if enabled { "on" } else { "off" });
            }
        }
    }

    fn on_control(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Stop => self.running = false,
            ControlCommand::Reload(tuning) => {
                self.shared.apply_tuning(&tuning);
                info!("[{}] Reloaded runtime settings: {:?}", self.shared.name, tuning);
            }
            ControlCommand::ForceCleanup => self.force_cleanup(),
        }
    }

    fn force_cleanup(&mut self) {
        let freed = self.shared.allocator.trim();
        self.shared.metrics.reset_latencies();
        self.process_restarts();

        let mut reaped = 0;
        if let Some(topology) = self.shared.workers.try_lock_topology() {
            for worker in self.shared.workers.all() {
                if worker.state() != WorkerState::Error || self.pending_restarts.contains_key(&worker.id()) {
                    continue;
                }
                if let Some(worker) = self.shared.workers.remove(&topology, worker.id()) {
                    let _ = worker.stop(Duration::ZERO);
                    reaped += 1;
                }
            }
        }
        info!(
            "[{}] Cleanup released {} buffers and reaped {} workers",
            self.shared.name, freed, reaped
        );
    }

    fn check_drained(&mut self) {
        let Some(deadline) = self.drain_deadline else {
            return;
        };
        let outstanding = self.shared.outstanding_tasks();
        if outstanding == 0 {
            debug!("[{}] Drained all tasks", self.shared.name);
            self.running = false;
        } else if Instant::now() >= deadline {
            warn!("[{}] {} tasks still unfinished at the drain deadline", self.shared.name, outstanding);
            self.running = false;
        }
    }

    // --- Bookkeeping ---

    fn publish(&self) {
        self.shared.publish_task_counts(self.in_flight.len(), self.held.len());
    }

    fn fail_remaining(&mut self) {
        let mut remaining: Vec<Arc<Task>> = self.held.drain(..).collect();
        while let Some(task) = self.consumer.dequeue() {
            remaining.push(task);
        }
        remaining.extend(self.in_flight.drain().map(|(_, entry)| entry.task));

        let mut failed = 0;
        for task in remaining {
            if task.finish(Outcome::failed(ErrorCode::ShutdownInProgress, "Pool is shutting down")) {
                failed += 1;
            }
        }
        if failed > 0 {
            self.shared.metrics.record(Metric::TaskFailed, failed);
            warn!("[{}] Failed {} unfinished tasks at shutdown", self.shared.name, failed);
        }
        self.publish();
    }
}

fn trace_suffix(task: &Task) -> String {
    task.desc().trace_id.as_ref().map(|id| format!(" (trace {})", id)).unwrap_or_default()
}
