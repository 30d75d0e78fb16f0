use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use procpool_api::{PoolError, Result, TaskId, MAX_TASK_DATA_SIZE};
use serde::Serialize;

/// Recycled buffers kept per pool.
pub const MAX_FREE_BUFFERS: usize = 1000;

// Larger buffers are returned to the system instead of the free list
const MAX_RECYCLED_CAPACITY: usize = 2 * MAX_TASK_DATA_SIZE;

/// Counters describing allocator use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    pub live_tasks: usize,
    pub free_buffers: usize,
    pub allocated: u64,
    pub reused: u64,
}

/// Per-pool task id source and payload buffer free-list.
///
/// Buffers of released tasks go back to a bounded lock-free queue and are
/// handed out again to later tasks, so steady-state submission does not hit
/// the global allocator.
#[derive(Debug)]
pub struct TaskAllocator {
    free: ArrayQueue<Vec<u8>>,
    next_id: AtomicU64,
    live: AtomicUsize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl TaskAllocator {
    pub fn new() -> Self {
        Self::with_free_limit(MAX_FREE_BUFFERS)
    }

    pub fn with_free_limit(limit: usize) -> Self {
        Self {
            free: ArrayQueue::new(limit.max(1)),
            next_id: AtomicU64::new(1),
            live: AtomicUsize::new(0),
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Next task id; ids start at 1 and never repeat within a pool.
    pub fn next_id(&self) -> TaskId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Copy of `data` in a recycled buffer when one is large enough.
    pub fn copy_of(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut buf = self.acquire(data.len())?;
        buf.extend_from_slice(data);
        Ok(buf)
    }

    /// Empty buffer with room for at least `len` bytes.
    ///
    /// Allocation failure is reported as `OutOfMemory` instead of aborting.
    pub fn acquire(&self, len: usize) -> Result<Vec<u8>> {
        if let Some(mut buf) = self.free.pop() {
            buf.clear();
            if buf.capacity() >= len {
                self.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(buf);
            }
            reserve(&mut buf, len)?;
            self.allocated.fetch_add(1, Ordering::Relaxed);
            return Ok(buf);
        }

        let mut buf = Vec::new();
        reserve(&mut buf, len)?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }

    /// Returns a buffer to the free list; dropped if the list is full.
    pub fn recycle(&self, mut buf: Vec<u8>) {
        if buf.capacity() == 0 || buf.capacity() > MAX_RECYCLED_CAPACITY {
            return;
        }
        buf.clear();
        let _ = self.free.push(buf);
    }

    /// Frees every recycled buffer, returning how many were released.
    pub fn trim(&self) -> usize {
        let mut released = 0;
        while self.free.pop().is_some() {
            released += 1;
        }
        released
    }

    pub(crate) fn task_created(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_released(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            live_tasks: self.live.load(Ordering::Relaxed),
            free_buffers: self.free.len(),
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }
}

impl Default for TaskAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn reserve(buf: &mut Vec<u8>, len: usize) -> Result<()> {
    buf.try_reserve_exact(len)
        .map_err(|e| PoolError::OutOfMemory(format!("task buffer of {} bytes: {}", len, e)))
}
