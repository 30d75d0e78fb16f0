use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use procpool_api::{PoolError, Result};

/// A bounded single-producer, single-consumer lock-free ring.
///
/// The ring is created split into a [`RingProducer`] and a [`RingConsumer`].
/// Neither half is `Clone` and every mutating call takes `&mut self`, so the
/// SPSC contract holds by construction: callers that need several producers
/// must serialize them (see [`AdmissionQueue`](super::AdmissionQueue)).
///
/// # Key Implementation Details
/// - Capacity is a power of two and `capacity - 1` is the index mask
/// - One slot is always kept free so that full and empty can be told apart
/// - `head` and `tail` are free-running counters; only their masked value
///   addresses a slot
/// - The producer publishes `tail` with release ordering after writing the
///   slot; the consumer publishes `head` with release ordering after taking it
pub struct RingQueue<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// Slots are only touched by the single producer (free slots) or the single
// consumer (filled slots); the index protocol keeps those sets disjoint.
unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    /// Creates a ring with `capacity` slots, `capacity - 1` of them usable.
    pub fn with_capacity(capacity: usize) -> Result<(RingProducer<T>, RingConsumer<T>)> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(PoolError::InvalidParameter(format!(
                "ring capacity ({}) must be a power of two >= 2",
                capacity
            )));
        }

        let slots = (0..capacity).map(|_| UnsafeCell::new(None)).collect();
        let ring = Arc::new(RingQueue {
            slots,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        });

        Ok((RingProducer { ring: ring.clone() }, RingConsumer { ring }))
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn free_slots(&self, tail: usize) -> usize {
        let head = self.head.load(Ordering::Acquire);
        self.mask - (tail.wrapping_sub(head) & self.mask)
    }

    fn available(&self, head: usize) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) & self.mask
    }

    // Safety: caller is the producer and the slot at `index` is free.
    unsafe fn write(&self, index: usize, item: T) {
        unsafe { *self.slots[index & self.mask].get() = Some(item) };
    }

    // Safety: caller is the consumer and the slot at `index` is filled.
    unsafe fn take(&self, index: usize) -> Option<T> {
        unsafe { (*self.slots[index & self.mask].get()).take() }
    }
}

impl<T> fmt::Debug for RingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// Producing half of a [`RingQueue`].
#[derive(Debug)]
pub struct RingProducer<T> {
    ring: Arc<RingQueue<T>>,
}

impl<T> RingProducer<T> {
    /// Pushes `item` at the tail, handing it back if the ring is full.
    pub fn enqueue(&mut self, item: T) -> std::result::Result<(), T> {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let head = self.ring.head.load(Ordering::Acquire);
        if (tail.wrapping_add(1) & self.ring.mask) == (head & self.ring.mask) {
            return Err(item);
        }

        unsafe { self.ring.write(tail, item) };
        self.ring.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Moves as many items from the front of `items` as fit, publishing the
    /// new tail once. Returns how many were moved.
    pub fn enqueue_batch(&mut self, items: &mut Vec<T>) -> usize {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let count = self.ring.free_slots(tail).min(items.len());

        for (offset, item) in items.drain(..count).enumerate() {
            unsafe { self.ring.write(tail.wrapping_add(offset), item) };
        }
        self.ring.tail.store(tail.wrapping_add(count), Ordering::Release);
        count
    }

    /// Slots that can be filled right now.
    pub fn free_slots(&self) -> usize {
        self.ring.free_slots(self.ring.tail.load(Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Shared view used for lock-free length reads.
    pub fn ring(&self) -> &Arc<RingQueue<T>> {
        &self.ring
    }
}

/// Consuming half of a [`RingQueue`].
#[derive(Debug)]
pub struct RingConsumer<T> {
    ring: Arc<RingQueue<T>>,
}

impl<T> RingConsumer<T> {
    /// Pops the item at the head, if any.
    pub fn dequeue(&mut self) -> Option<T> {
        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Acquire);
        if (head & self.ring.mask) == (tail & self.ring.mask) {
            return None;
        }

        let item = unsafe { self.ring.take(head) };
        self.ring.head.store(head.wrapping_add(1), Ordering::Release);
        item
    }

    /// Pops up to `max` items into `out`, publishing the new head once.
    pub fn dequeue_batch(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let head = self.ring.head.load(Ordering::Relaxed);
        let count = self.ring.available(head).min(max);

        out.reserve(count);
        for offset in 0..count {
            if let Some(item) = unsafe { self.ring.take(head.wrapping_add(offset)) } {
                out.push(item);
            }
        }
        self.ring.head.store(head.wrapping_add(count), Ordering::Release);
        count
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}
