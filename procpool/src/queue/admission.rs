use std::sync::{Arc, Mutex, PoisonError};

use super::ring::{RingProducer, RingQueue};

/// The single admission point in front of the SPSC [`RingQueue`].
///
/// Any number of threads may submit; they are serialized on one mutex so the
/// ring only ever sees a single producer. Requeues from the dispatcher go
/// through here as well and therefore land at the tail.
#[derive(Debug)]
pub struct AdmissionQueue<T> {
    producer: Mutex<RingProducer<T>>,
    ring: Arc<RingQueue<T>>,
}

impl<T> AdmissionQueue<T> {
    pub fn new(producer: RingProducer<T>) -> Self {
        let ring = producer.ring().clone();
        Self { producer: Mutex::new(producer), ring }
    }

    /// Enqueues one item, handing it back when the queue is full.
    pub fn submit(&self, item: T) -> Result<(), T> {
        self.producer.lock().unwrap_or_else(PoisonError::into_inner).enqueue(item)
    }

    /// Enqueues all of `items` or none of them.
    pub fn submit_all(&self, mut items: Vec<T>) -> Result<(), Vec<T>> {
        let mut producer = self.producer.lock().unwrap_or_else(PoisonError::into_inner);
        if producer.free_slots() < items.len() {
            return Err(items);
        }
        producer.enqueue_batch(&mut items);
        debug_assert!(items.is_empty());
        Ok(())
    }

    /// Items waiting in the ring; lock-free.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Items the queue can hold at once.
    pub fn usable_capacity(&self) -> usize {
        self.ring.capacity() - 1
    }
}
