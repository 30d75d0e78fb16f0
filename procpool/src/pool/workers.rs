use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use procpool_api::{PoolError, Result, WorkerId};
use tracing::{debug, warn};

use crate::worker::{SupervisorContext, WorkerSupervisor};

/// Proof that the caller holds the topology lock.
///
/// Adding and removing workers requires one, so resize, restarts and
/// auto-scaling never interleave.
pub struct TopologyGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// The pool's worker slots, indexed by worker id.
///
/// Slot reads take a short lock; changes additionally need a [`TopologyGuard`].
pub struct WorkerSet {
    ctx: Arc<SupervisorContext>,
    max_workers: usize,
    slots: Mutex<Vec<Option<Arc<WorkerSupervisor>>>>,
    topology: Mutex<()>,
    next_generation: AtomicU64,
}

impl fmt::Debug for WorkerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSet")
            .field("pool", &self.ctx.pool_name)
            .field("max_workers", &self.max_workers)
            .field("count", &self.count())
            .finish()
    }
}

impl WorkerSet {
    pub fn new(ctx: Arc<SupervisorContext>, max_workers: usize) -> Self {
        Self {
            ctx,
            max_workers,
            slots: Mutex::new(Vec::with_capacity(max_workers)),
            topology: Mutex::new(()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn lock_topology(&self) -> TopologyGuard<'_> {
        TopologyGuard { _guard: self.topology.lock().unwrap_or_else(PoisonError::into_inner) }
    }

    /// `None` when another thread is changing the worker set.
    pub fn try_lock_topology(&self) -> Option<TopologyGuard<'_>> {
        match self.topology.try_lock() {
            Ok(guard) => Some(TopologyGuard { _guard: guard }),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                Some(TopologyGuard { _guard: poisoned.into_inner() })
            }
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    pub fn get(&self, id: WorkerId) -> Option<Arc<WorkerSupervisor>> {
        self.lock_slots().get(id as usize).cloned().flatten()
    }

    /// Every occupied slot in id order.
    pub fn all(&self) -> Vec<Arc<WorkerSupervisor>> {
        self.lock_slots().iter().flatten().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.lock_slots().iter().flatten().count()
    }

    pub fn live_count(&self) -> usize {
        self.lock_slots().iter().flatten().filter(|w| w.is_alive()).count()
    }

    pub fn idle_count(&self) -> usize {
        self.lock_slots().iter().flatten().filter(|w| w.is_idle()).count()
    }

    /// The idle worker with the lowest id.
    pub fn first_idle(&self) -> Option<Arc<WorkerSupervisor>> {
        self.lock_slots().iter().flatten().find(|w| w.is_idle()).cloned()
    }

    /// Lowest id without a worker, if the pool is below its maximum.
    pub fn free_id(&self) -> Option<WorkerId> {
        let slots = self.lock_slots();
        let id = slots.iter().position(Option::is_none).unwrap_or(slots.len());
        (id < self.max_workers).then_some(id as WorkerId)
    }

    /// Ids of occupied slots, highest first.
    pub fn ids_descending(&self) -> Vec<WorkerId> {
        let slots = self.lock_slots();
        (0..slots.len())
            .rev()
            .filter(|i| slots[*i].is_some())
            .map(|i| i as WorkerId)
            .collect()
    }

    /// Creates and starts a worker in slot `id`.
    ///
    /// A failed start is retried once after a reset. The slot is only
    /// occupied once the worker runs.
    pub fn spawn(&self, _topology: &TopologyGuard<'_>, id: WorkerId, restarts: u32) -> Result<Arc<WorkerSupervisor>> {
        if id as usize >= self.max_workers {
            return Err(PoolError::InvalidParameter(format!(
                "worker id {} exceeds max_workers {}",
                id, self.max_workers
            )));
        }
        if self.get(id).is_some() {
            return Err(PoolError::InvalidParameter(format!("worker slot {} is occupied", id)));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let supervisor = WorkerSupervisor::create(self.ctx.clone(), id, generation, restarts)?;
        if let Err(err) = supervisor.start() {
            warn!("[{}] Worker {} failed to start, retrying once: {}", self.ctx.pool_name, id, err);
            supervisor.reset()?;
            if let Err(err) = supervisor.start() {
                let _ = supervisor.stop(Duration::ZERO);
                return Err(err);
            }
        }

        let mut slots = self.lock_slots();
        if slots.len() <= id as usize {
            slots.resize(id as usize + 1, None);
        }
        slots[id as usize] = Some(supervisor.clone());
        debug!("[{}] Worker {} occupies its slot (generation {})", self.ctx.pool_name, id, generation);
        Ok(supervisor)
    }

    /// Empties slot `id` and returns its worker. The caller stops it.
    pub fn remove(&self, _topology: &TopologyGuard<'_>, id: WorkerId) -> Option<Arc<WorkerSupervisor>> {
        let mut slots = self.lock_slots();
        let removed = slots.get_mut(id as usize).and_then(Option::take);
        while matches!(slots.last(), Some(None)) {
            slots.pop();
        }
        removed
    }

    /// Stops and removes every worker, each with `timeout` to exit.
    pub fn stop_all(&self, timeout: Duration) {
        let topology = self.lock_topology();
        for id in self.ids_descending() {
            if let Some(worker) = self.remove(&topology, id) {
                if let Err(err) = worker.stop(timeout) {
                    warn!("[{}] Failed to stop worker {}: {}", self.ctx.pool_name, id, err);
                }
            }
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Option<Arc<WorkerSupervisor>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
