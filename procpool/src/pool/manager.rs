//! # Pool Manager
//!
//! Top-level handle of a worker pool.
//!
//! ## Key Concepts
//! - Lifecycle: `Created -> Starting -> Running -> Stopping -> Stopped`,
//!   changed only under the lifecycle mutex
//! - Submission: tasks pass one admission mutex into the pending-task ring
//!   and the event loop is notified; a full ring is reported as `QueueFull`
//! - Topology: `resize` and the event loop's restarts and auto-scaling all
//!   change the worker set under the topology lock
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use procpool::{PoolConfig, PoolManager, TaskDesc};
//!
//! let pool = PoolManager::create(PoolConfig::new("example"))?;
//! pool.start()?;
//! let result = pool.submit_sync(TaskDesc::new("echo"), b"hello", None)?;
//! assert_eq!(result.output_bytes(), b"hello");
//! pool.stop(std::time::Duration::from_secs(5))?;
//! # Ok::<(), procpool::PoolError>(())
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use procpool_api::{
    PoolError, PoolState, PoolStats, Result, TaskDesc, TaskResult, TaskState, WorkerId, WorkerInfo,
};
use tracing::{debug, error, info, trace, warn};

use super::metrics::Metric;
use super::shared::PoolShared;
use super::workers::WorkerSet;
use crate::config::{PoolConfig, RuntimeTuning};
use crate::event_loop::{ControlCommand, Event, EventLoop, LoopParts, PoolSignal, SignalBridge};
use crate::queue::{AdmissionQueue, RingQueue};
use crate::task::{AllocatorStats, FinishHook, Task, TaskFuture};
use crate::worker::{transport_for, SupervisorContext, WorkerRuntime};

/// Bound on writing one task frame into a worker's channel.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll period while waiting for tasks or draining workers.
const DRAIN_POLL: Duration = Duration::from_millis(10);

struct Lifecycle {
    /// Present until the loop is started, and again after a failed start
    parts: Option<LoopParts>,
    event_loop: Option<JoinHandle<LoopParts>>,
    signals: Option<SignalBridge>,
    destroyed: bool,
}

/// A self-scaling pool of worker processes.
///
/// Dropping the manager destroys the pool.
pub struct PoolManager {
    shared: Arc<PoolShared>,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("name", &self.shared.name)
            .field("state", &self.shared.state())
            .field("workers", &self.shared.workers)
            .finish()
    }
}

impl PoolManager {
    /// Validates `config` and allocates the queue, channels and worker set.
    /// No worker runs until [`start`](Self::start).
    pub fn create(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let (producer, consumer) = RingQueue::with_capacity(config.queue_size)?;
        let (events_tx, events_rx) = flume::unbounded();

        let runtime = Arc::new(WorkerRuntime {
            pool_name: config.pool_name.clone(),
            handlers: config.handler_registry(),
            user_context: config.user_context.clone(),
            heartbeat_interval: config.heartbeat_interval,
        });
        let ctx = Arc::new(SupervisorContext {
            pool_name: config.pool_name.clone(),
            transport: transport_for(config.transport),
            runtime,
            events: events_tx.clone(),
            heartbeat_interval: config.heartbeat_interval,
            stop_timeout: config.stop_timeout,
            send_timeout: SEND_TIMEOUT,
            slot_count: config.channel_slots,
            slot_size: config.slot_size,
        });
        let workers = WorkerSet::new(ctx, config.max_workers);

        info!(
            "[{}] Pool created: workers {}..={}, queue {}, {:?} transport",
            config.pool_name, config.min_workers, config.max_workers, config.queue_size, config.transport
        );
        debug!("[{}] {:?}", config.pool_name, config);

        let shared = Arc::new(PoolShared::new(config, AdmissionQueue::new(producer), workers, events_tx));
        Ok(Self {
            shared,
            lifecycle: Mutex::new(Lifecycle {
                parts: Some(LoopParts { consumer, events: events_rx }),
                event_loop: None,
                signals: None,
                destroyed: false,
            }),
        })
    }

    /// Starts the event loop and `min_workers` workers.
    ///
    /// Any failure stops what was started and leaves the pool in `Created`.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle();
        let name = self.shared.name.clone();
        match self.shared.state() {
            PoolState::Created => {}
            PoolState::Stopping | PoolState::Stopped => return Err(PoolError::ShutdownInProgress),
            state => return Err(PoolError::InvalidParameter(format!("pool {} is already {}", name, state))),
        }
        let Some(parts) = lifecycle.parts.take() else {
            return Err(PoolError::InvalidParameter(format!("pool {} has no event loop to start", name)));
        };

        self.shared.set_state(PoolState::Starting);
        info!("[{}] Starting pool", name);

        if self.shared.config.handle_signals {
            match SignalBridge::start(&name, self.shared.events.clone()) {
                Ok(bridge) => lifecycle.signals = Some(bridge),
                Err(err) => {
                    lifecycle.parts = Some(parts);
                    self.shared.set_state(PoolState::Created);
                    return Err(err);
                }
            }
        }

        let shared = self.shared.clone();
        let event_loop = thread::Builder::new()
            .name(format!("{}-event-loop", name))
            .spawn(move || EventLoop::new(shared, parts).run())
            .map_err(|err| {
                lifecycle.signals = None;
                self.shared.set_state(PoolState::Created);
                error!("[{}] Failed to spawn the event loop: {}", name, err);
                PoolError::syscall("spawn event loop", err)
            })?;

        let spawned = {
            let topology = self.shared.workers.lock_topology();
            (0..self.shared.config.min_workers)
                .try_for_each(|id| self.shared.workers.spawn(&topology, id as WorkerId, 0).map(drop))
        };
        if let Err(err) = spawned {
            error!("[{}] Start failed, rolling back: {}", name, err);
            self.shared.workers.stop_all(self.shared.config.stop_timeout);
            let _ = self.shared.events.send(Event::Control(ControlCommand::Stop));
            match event_loop.join() {
                Ok(parts) => lifecycle.parts = Some(parts),
                Err(_) => error!("[{}] Event loop panicked during rollback", name),
            }
            lifecycle.signals = None;
            self.shared.set_state(PoolState::Created);
            return Err(err);
        }

        lifecycle.event_loop = Some(event_loop);
        self.shared.set_target_workers(self.shared.config.min_workers);
        self.shared.mark_started();
        self.shared.set_state(PoolState::Running);
        let _ = self.shared.events.send(Event::WorkersChanged);
        info!("[{}] Pool running with {} workers", name, self.shared.workers.count());
        Ok(())
    }

    /// Submits a task and blocks for its result.
    ///
    /// `timeout` bounds the wait and falls back to the descriptor's timeout.
    /// A wait timeout returns `Timeout` and leaves the task running.
    pub fn submit_sync(&self, desc: TaskDesc, input: &[u8], timeout: Option<Duration>) -> Result<TaskResult> {
        let timeout = timeout.or(desc.timeout);
        self.submit_async(desc, input)?.wait(timeout)
    }

    /// Submits a task and returns a handle to it.
    pub fn submit_async(&self, desc: TaskDesc, input: &[u8]) -> Result<TaskFuture> {
        let task = self.prepare(desc, input)?;
        self.shared.tasks_admitted(1);
        if self.shared.admission.submit(task.clone()).is_err() {
            self.shared.tasks_settled(1);
            return Err(self.queue_full());
        }
        self.submitted(1);
        trace!("[{}] Submitted task {}", self.shared.name, task.id());
        Ok(TaskFuture::new(task))
    }

    /// Submits every task or none of them.
    pub fn submit_batch<I, B>(&self, items: I) -> Result<Vec<TaskFuture>>
    where
        I: IntoIterator<Item = (TaskDesc, B)>,
        B: AsRef<[u8]>,
    {
        self.accepting()?;
        let tasks = items
            .into_iter()
            .map(|(desc, input)| self.prepare(desc, input.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        self.shared.tasks_admitted(tasks.len());
        if self.shared.admission.submit_all(tasks.clone()).is_err() {
            self.shared.tasks_settled(tasks.len());
            return Err(self.queue_full());
        }
        self.submitted(tasks.len() as u64);
        debug!("[{}] Submitted a batch of {} tasks", self.shared.name, tasks.len());
        Ok(tasks.into_iter().map(TaskFuture::new).collect())
    }

    /// Changes the worker count to `target`, clamped to `[min_workers, max_workers]`.
    ///
    /// Growing spawns workers with the lowest free ids and removes them all
    /// again if one fails. Shrinking retires the highest ids once their
    /// current task has finished, or after the task timeout plus the stop
    /// timeout; a task cut off that way fails with `WorkerDead`.
    pub fn resize(&self, target: usize) -> Result<()> {
        let _lifecycle = self.lock_lifecycle();
        self.accepting()?;

        let config = &self.shared.config;
        let clamped = target.clamp(config.min_workers, config.max_workers);
        if clamped != target {
            warn!(
                "[{}] Resize target {} clamped to {} (bounds {}..={})",
                self.shared.name, target, clamped, config.min_workers, config.max_workers
            );
        }

        let topology = self.shared.workers.lock_topology();
        let current = self.shared.workers.count();
        if clamped > current {
            let mut added = Vec::new();
            for _ in current..clamped {
                let Some(id) = self.shared.workers.free_id() else {
                    break;
                };
                match self.shared.workers.spawn(&topology, id, 0) {
                    Ok(_) => added.push(id),
                    Err(err) => {
                        warn!("[{}] Resize to {} failed, rolling back: {}", self.shared.name, clamped, err);
                        for id in added.into_iter().rev() {
                            if let Some(worker) = self.shared.workers.remove(&topology, id) {
                                let _ = worker.shutdown();
                            }
                        }
                        return Err(err);
                    }
                }
            }
        } else if clamped < current {
            let retiring: Vec<_> = self
                .shared
                .workers
                .ids_descending()
                .into_iter()
                .take(current - clamped)
                .filter_map(|id| self.shared.workers.get(id))
                .collect();
            for worker in &retiring {
                worker.set_draining();
            }

            let task_timeout = self.shared.task_timeout();
            let deadline = (!task_timeout.is_zero()).then(|| Instant::now() + task_timeout + config.stop_timeout);
            // Claiming an idle worker keeps the event loop from sending it
            // anything more; tasks of workers stopped while busy are failed
            // by the loop once it sees the set change
            while !retiring.iter().all(|w| w.try_retire() || !w.is_alive()) {
                if deadline.is_some_and(|at| Instant::now() >= at) {
                    warn!("[{}] Retiring workers are still busy; stopping them anyway", self.shared.name);
                    break;
                }
                thread::sleep(DRAIN_POLL);
            }

            for worker in retiring {
                self.shared.workers.remove(&topology, worker.id());
                if let Err(err) = worker.shutdown() {
                    warn!("[{}] Failed to stop worker {}: {}", self.shared.name, worker.id(), err);
                }
            }
        }
        drop(topology);

        self.shared.set_target_workers(clamped);
        let _ = self.shared.events.send(Event::WorkersChanged);
        info!("[{}] Resized to {} workers", self.shared.name, self.shared.workers.count());
        Ok(())
    }

    /// Stops accepting tasks, waits up to `timeout` for queued and running
    /// tasks, then stops every worker and the event loop. Tasks still
    /// unfinished fail with `ShutdownInProgress`. Idempotent.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle();
        let name = self.shared.name.clone();
        match self.shared.state() {
            PoolState::Created => {
                self.shared.set_state(PoolState::Stopped);
                return Ok(());
            }
            PoolState::Stopped if lifecycle.event_loop.is_none() => return Ok(()),
            _ => {}
        }

        self.shared.transition(PoolState::Running, PoolState::Stopping);
        info!("[{}] Stopping pool", name);

        let deadline = Instant::now() + timeout;
        while self.shared.outstanding_tasks() > 0 && Instant::now() < deadline {
            thread::sleep(DRAIN_POLL);
        }
        let unfinished = self.shared.outstanding_tasks();
        if unfinished > 0 {
            warn!("[{}] {} tasks still unfinished after {:?}", name, unfinished, timeout);
        }

        let _ = self.shared.events.send(Event::Control(ControlCommand::Stop));
        if let Some(event_loop) = lifecycle.event_loop.take() {
            if event_loop.join().is_err() {
                error!("[{}] Event loop panicked", name);
            }
        }
        self.shared.workers.stop_all(self.shared.config.stop_timeout);
        if let Some(mut signals) = lifecycle.signals.take() {
            signals.stop();
        }

        self.shared.set_state(PoolState::Stopped);
        info!("[{}] Pool stopped", name);
        Ok(())
    }

    /// Stops the pool without waiting for tasks and releases cached buffers.
    /// Idempotent; also run on drop.
    pub fn destroy(&self) {
        if let Err(err) = self.stop(Duration::ZERO) {
            warn!("[{}] Stop during destroy failed: {}", self.shared.name, err);
        }
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.destroyed {
            return;
        }
        lifecycle.destroyed = true;
        lifecycle.parts = None;
        let released = self.shared.allocator.trim();
        debug!("[{}] Pool destroyed, released {} buffers", self.shared.name, released);
    }

    /// Sends a command to the event loop. `Stop` performs a full [`stop`](Self::stop).
    pub fn control(&self, command: ControlCommand) -> Result<()> {
        if command == ControlCommand::Stop {
            return self.stop(self.shared.config.stop_timeout);
        }
        self.accepting()?;
        self.shared
            .events
            .send(Event::Control(command))
            .map_err(|_| PoolError::ShutdownInProgress)
    }

    /// Hands `signal` to the event loop as if the process had received it.
    /// `Terminate` and `Interrupt` drain outstanding tasks for up to the stop
    /// timeout before the workers are stopped.
    pub fn deliver_signal(&self, signal: PoolSignal) -> Result<()> {
        self.accepting()?;
        debug!("[{}] Delivering {:?}", self.shared.name, signal);
        self.shared
            .events
            .send(Event::Signal(signal))
            .map_err(|_| PoolError::ShutdownInProgress)
    }

    /// Applies new runtime settings without restarting workers.
    pub fn reload(&self, tuning: RuntimeTuning) -> Result<()> {
        self.control(ControlCommand::Reload(tuning))
    }

    pub fn set_debug_mode(&self, enabled: bool) {
        self.shared.set_debug_mode(enabled);
        info!("[{}] Debug mode {}", self.shared.name, if enabled { "on" } else { "off" });
    }

    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn get_stats(&self) -> PoolStats {
        self.shared.snapshot()
    }

    pub fn get_workers(&self) -> Vec<WorkerInfo> {
        self.shared.workers.all().iter().map(|w| w.info()).collect()
    }

    pub fn get_worker(&self, id: WorkerId) -> Option<WorkerInfo> {
        self.shared.workers.get(id).map(|w| w.info())
    }

    pub fn allocator_stats(&self) -> AllocatorStats {
        self.shared.allocator.stats()
    }

    /// Events handled by the event loop so far.
    pub fn events_processed(&self) -> u64 {
        self.shared.events_processed()
    }

    pub fn timer_ticks(&self) -> u64 {
        self.shared.timer_ticks()
    }

    fn prepare(&self, desc: TaskDesc, input: &[u8]) -> Result<Arc<Task>> {
        self.accepting()?;
        let config = &self.shared.config;
        if let Some(handler) = desc.handler.as_deref() {
            if !config.handlers.contains_key(handler) {
                return Err(PoolError::InvalidParameter(format!("unknown handler {:?}", handler)));
            }
        }
        let limit = config.max_input_size(desc.handler.as_ref().map_or(0, String::len));
        if input.len() > limit {
            return Err(PoolError::InvalidParameter(format!(
                "task input of {} bytes exceeds the limit of {} bytes",
                input.len(),
                limit
            )));
        }
        Task::create(&self.shared.allocator, desc, input, Some(self.finish_hook()))
    }

    /// Settles the task in the outstanding count. A cancellation is also
    /// counted and handed to the event loop so it can tell the worker.
    fn finish_hook(&self) -> FinishHook {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |task_id, previous, state| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.tasks_settled(1);
            if state == TaskState::Cancelled {
                shared.metrics.record(Metric::TaskCancelled, 1);
                trace!("[{}] Task {} cancelled while {}", shared.name, task_id, previous);
                let _ = shared.events.send(Event::TaskCancelled(task_id));
            }
        })
    }

    fn accepting(&self) -> Result<()> {
        match self.shared.state() {
            PoolState::Running => Ok(()),
            PoolState::Stopping | PoolState::Stopped => Err(PoolError::ShutdownInProgress),
            state => Err(PoolError::InvalidParameter(format!(
                "pool {} is not running ({})",
                self.shared.name, state
            ))),
        }
    }

    fn submitted(&self, count: u64) {
        self.shared.metrics.record(Metric::TaskSubmitted, count);
        let _ = self.shared.events.send(Event::TaskSubmitted);
    }

    fn queue_full(&self) -> PoolError {
        PoolError::QueueFull { capacity: self.shared.admission.usable_capacity() }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
