use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use procpool_api::{PoolState, PoolStats};

use super::metrics::Metrics;
use super::workers::WorkerSet;
use crate::config::{PoolConfig, RuntimeTuning};
use crate::event_loop::Event;
use crate::queue::AdmissionQueue;
use crate::task::{Task, TaskAllocator};

/// State shared by the pool manager, the event loop and task finish hooks.
///
/// Everything here is either immutable after creation or guarded on its own:
/// the admission queue and the worker set each have a mutex, counters and
/// live settings are atomics.
pub struct PoolShared {
    pub(crate) name: String,
    pub(crate) config: PoolConfig,
    state: AtomicU8,
    pub(crate) admission: AdmissionQueue<Arc<Task>>,
    pub(crate) allocator: Arc<TaskAllocator>,
    pub(crate) metrics: Metrics,
    pub(crate) workers: WorkerSet,
    pub(crate) events: flume::Sender<Event>,

    /// Tasks dispatched and not finished, as last published by the event loop
    running_tasks: AtomicUsize,
    /// Tasks popped from the ring that could not be dispatched yet
    held_tasks: AtomicUsize,
    /// Admitted tasks not yet in a terminal state
    outstanding: AtomicUsize,

    degraded: AtomicBool,
    debug_mode: AtomicBool,
    target_workers: AtomicUsize,
    events_processed: AtomicU64,
    timer_ticks: AtomicU64,

    // Live settings changed by Reload
    task_timeout_ms: AtomicU64,
    idle_timeout_ms: AtomicU64,
    auto_scaling: AtomicBool,

    started_at: Mutex<Option<Instant>>,
}

impl PoolShared {
    pub(crate) fn new(
        config: PoolConfig,
        admission: AdmissionQueue<Arc<Task>>,
        workers: WorkerSet,
        events: flume::Sender<Event>,
    ) -> Self {
        Self {
            name: config.pool_name.clone(),
            state: AtomicU8::new(PoolState::Created as u8),
            admission,
            allocator: Arc::new(TaskAllocator::new()),
            metrics: Metrics::new(config.enable_metrics),
            workers,
            events,
            running_tasks: AtomicUsize::new(0),
            held_tasks: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            degraded: AtomicBool::new(false),
            debug_mode: AtomicBool::new(false),
            target_workers: AtomicUsize::new(config.min_workers),
            events_processed: AtomicU64::new(0),
            timer_ticks: AtomicU64::new(0),
            task_timeout_ms: AtomicU64::new(duration_ms(config.task_timeout)),
            idle_timeout_ms: AtomicU64::new(duration_ms(config.worker_idle_timeout)),
            auto_scaling: AtomicBool::new(config.enable_auto_scaling),
            started_at: Mutex::new(None),
            config,
        }
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(PoolState::Stopped)
    }

    pub(crate) fn set_state(&self, state: PoolState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Moves `from -> to` only if the pool is still in `from`.
    pub(crate) fn transition(&self, from: PoolState, to: PoolState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_started(&self) {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    pub fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Queued in the ring plus held back by the dispatcher.
    pub fn pending_tasks(&self) -> usize {
        self.admission.len() + self.held_tasks.load(Ordering::Acquire)
    }

    pub fn running_tasks(&self) -> usize {
        self.running_tasks.load(Ordering::Acquire)
    }

    pub(crate) fn publish_task_counts(&self, running: usize, held: usize) {
        self.running_tasks.store(running, Ordering::Release);
        self.held_tasks.store(held, Ordering::Release);
    }

    /// Submitted tasks that have not finished, wherever they are.
    pub fn outstanding_tasks(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn tasks_admitted(&self, count: usize) {
        self.outstanding.fetch_add(count, Ordering::AcqRel);
    }

    pub(crate) fn tasks_settled(&self, count: usize) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(count)));
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Release);
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode.load(Ordering::Acquire)
    }

    pub(crate) fn set_debug_mode(&self, enabled: bool) {
        self.debug_mode.store(enabled, Ordering::Release);
    }

    /// Toggles debug mode and returns the new value.
    pub(crate) fn toggle_debug_mode(&self) -> bool {
        !self.debug_mode.fetch_xor(true, Ordering::AcqRel)
    }

    /// Worker count the pool converges to; changed by resize and auto-scaling.
    pub fn target_workers(&self) -> usize {
        self.target_workers.load(Ordering::Acquire)
    }

    pub(crate) fn set_target_workers(&self, target: usize) {
        self.target_workers.store(target, Ordering::Release);
    }

    pub(crate) fn count_event(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_tick(&self) {
        self.timer_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn timer_ticks(&self) -> u64 {
        self.timer_ticks.load(Ordering::Relaxed)
    }

    /// Running tasks older than this are timed out; zero disables expiry.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn auto_scaling(&self) -> bool {
        self.auto_scaling.load(Ordering::Relaxed)
    }

    /// Applies the fields of `tuning` that are set.
    pub(crate) fn apply_tuning(&self, tuning: &RuntimeTuning) {
        if let Some(timeout) = tuning.task_timeout {
            self.task_timeout_ms.store(duration_ms(timeout), Ordering::Relaxed);
        }
        if let Some(timeout) = tuning.worker_idle_timeout {
            self.idle_timeout_ms.store(duration_ms(timeout), Ordering::Relaxed);
        }
        if let Some(enabled) = tuning.enable_auto_scaling {
            self.auto_scaling.store(enabled, Ordering::Relaxed);
        }
        if let Some(enabled) = tuning.enable_metrics {
            self.metrics.set_enabled(enabled);
        }
    }

    /// Current statistics, computed from live counters.
    pub fn snapshot(&self) -> PoolStats {
        let workers = self.workers.all();
        let active_workers = workers.iter().filter(|w| w.is_alive()).count();
        let idle_workers = workers.iter().filter(|w| w.is_idle()).count();
        let execution = self.metrics.execution.snapshot();
        let queue = self.metrics.queue.snapshot();

        PoolStats {
            state: self.state(),
            active_workers,
            idle_workers,
            pending_tasks: self.pending_tasks(),
            running_tasks: self.running_tasks(),
            total_submitted: self.metrics.submitted.get(),
            total_completed: self.metrics.completed.get(),
            total_failed: self.metrics.failed.get(),
            total_cancelled: self.metrics.cancelled.get(),
            total_timed_out: self.metrics.timed_out.get(),
            total_restarts: self.metrics.restarts.get(),
            avg_task_time: execution.avg,
            max_task_time: execution.max,
            avg_queue_time: queue.avg,
            execution_latency: execution,
            queue_latency: queue,
            uptime: self.uptime(),
            degraded: self.is_degraded(),
            debug_mode: self.debug_mode(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
