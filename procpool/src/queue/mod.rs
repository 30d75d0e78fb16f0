//! Pending-task admission: a lock-free SPSC ring behind one admission mutex.

pub mod admission;
pub mod ring;

pub use admission::AdmissionQueue;
pub use ring::{RingConsumer, RingProducer, RingQueue};
