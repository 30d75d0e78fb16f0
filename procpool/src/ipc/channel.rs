use std::io;
use std::mem;
use std::ptr::{self, addr_of_mut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use procpool_api::{PoolError, Result};
use tracing::warn;

use super::shm::SharedRegion;
use crate::clock::deadline_after;

/// Bytes of length prefix at the start of every slot.
pub const LENGTH_PREFIX: usize = 4;

const ALIGN: usize = 64;

#[repr(C)]
struct ChannelHeader {
    mutex: libc::pthread_mutex_t,
    not_empty: libc::pthread_cond_t,
    not_full: libc::pthread_cond_t,
    slot_count: u64,
    slot_size: u64,
    producer_pos: AtomicU64,
    consumer_pos: AtomicU64,
    closed: AtomicU32,
}

/// Bounded byte ring living inside a [`SharedRegion`].
///
/// Each slot holds a 4-byte little-endian length followed by the payload.
/// Producer and consumer positions are free-running counters; the ring is
/// full when they are `slot_count` apart. All access happens under a
/// process-shared robust mutex, with `not_empty`/`not_full` condition
/// variables on `CLOCK_MONOTONIC` for bounded waits.
///
/// The channel holds no process-local state, so the same bytes can be used
/// by a master and a forked worker at once.
#[derive(Clone)]
pub struct SharedChannel {
    region: Arc<SharedRegion>,
    offset: usize,
}

impl SharedChannel {
    /// Bytes a channel with this geometry occupies in a region.
    pub fn footprint(slot_count: usize, slot_size: usize) -> usize {
        align_up(header_len() + slot_count * slot_size, ALIGN)
    }

    /// Initialises a fresh channel at `offset`, overwriting whatever was there.
    pub fn init(region: Arc<SharedRegion>, offset: usize, slot_count: usize, slot_size: usize) -> Result<Self> {
        if slot_count == 0 || slot_size <= LENGTH_PREFIX {
            return Err(PoolError::InvalidParameter(format!(
                "invalid channel geometry: {} slots of {} bytes",
                slot_count, slot_size
            )));
        }
        check_bounds(&region, offset, Self::footprint(slot_count, slot_size))?;

        let header = unsafe { region.as_ptr().add(offset) }.cast::<ChannelHeader>();
        unsafe {
            ptr::write_bytes(header.cast::<u8>(), 0, header_len());
            init_mutex(addr_of_mut!((*header).mutex))?;
            init_cond(addr_of_mut!((*header).not_empty))?;
            init_cond(addr_of_mut!((*header).not_full))?;
            addr_of_mut!((*header).slot_count).write(slot_count as u64);
            addr_of_mut!((*header).slot_size).write(slot_size as u64);
        }

        Ok(Self { region, offset })
    }

    /// Uses a channel another process already initialised at `offset`.
    pub fn attach(region: Arc<SharedRegion>, offset: usize) -> Result<Self> {
        check_bounds(&region, offset, header_len())?;
        let channel = Self { region, offset };
        let (slots, size) = (channel.slot_count(), channel.slot_size());
        if slots == 0 || size <= LENGTH_PREFIX {
            return Err(corrupt(format!("channel geometry {} x {}", slots, size)));
        }
        check_bounds(&channel.region, offset, Self::footprint(slots, size))?;
        Ok(channel)
    }

    pub fn slot_count(&self) -> usize {
        unsafe { (*self.header()).slot_count as usize }
    }

    pub fn slot_size(&self) -> usize {
        unsafe { (*self.header()).slot_size as usize }
    }

    /// Largest payload one slot can carry.
    pub fn max_payload(&self) -> usize {
        self.slot_size() - LENGTH_PREFIX
    }

    /// Messages currently queued; read without the lock.
    pub fn len(&self) -> usize {
        let (producer, consumer) = (self.producer_pos().load(Ordering::Acquire), self.consumer_pos().load(Ordering::Acquire));
        producer.saturating_sub(consumer) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed_flag().load(Ordering::Acquire) != 0
    }

    /// Copies `payload` into the next free slot, waiting up to `timeout` for room.
    pub fn enqueue(&self, payload: &[u8], timeout: Duration) -> Result<()> {
        if payload.len() > self.max_payload() {
            return Err(PoolError::InvalidParameter(format!(
                "payload of {} bytes exceeds slot capacity of {} bytes",
                payload.len(),
                self.max_payload()
            )));
        }

        let deadline = deadline_after(timeout);
        let guard = self.lock()?;
        let slot_count = self.slot_count() as u64;
        loop {
            if self.is_closed() {
                return Err(PoolError::ShutdownInProgress);
            }
            let producer = self.producer_pos().load(Ordering::Relaxed);
            let consumer = self.consumer_pos().load(Ordering::Relaxed);
            if producer - consumer < slot_count {
                break;
            }
            if !guard.wait(self.not_full(), &deadline)? {
                return Err(PoolError::Timeout(timeout));
            }
        }

        let producer = self.producer_pos().load(Ordering::Relaxed);
        unsafe {
            let slot = self.slot_ptr(producer);
            ptr::copy_nonoverlapping((payload.len() as u32).to_le_bytes().as_ptr(), slot, LENGTH_PREFIX);
            ptr::copy_nonoverlapping(payload.as_ptr(), slot.add(LENGTH_PREFIX), payload.len());
        }
        self.producer_pos().store(producer + 1, Ordering::Release);
        unsafe { libc::pthread_cond_signal(self.not_empty()) };
        drop(guard);
        Ok(())
    }

    /// Moves the oldest message into `out`, waiting up to `timeout` for one.
    ///
    /// Returns `Ok(false)` when the deadline passes with the channel still
    /// empty. A closed channel is drained first and then reports
    /// `ShutdownInProgress`.
    pub fn dequeue_into(&self, out: &mut Vec<u8>, timeout: Duration) -> Result<bool> {
        let deadline = deadline_after(timeout);
        let guard = self.lock()?;
        loop {
            let producer = self.producer_pos().load(Ordering::Relaxed);
            let consumer = self.consumer_pos().load(Ordering::Relaxed);
            if producer > consumer {
                break;
            }
            if self.is_closed() {
                return Err(PoolError::ShutdownInProgress);
            }
            if !guard.wait(self.not_empty(), &deadline)? {
                return Ok(false);
            }
        }

        let consumer = self.consumer_pos().load(Ordering::Relaxed);
        let copied = unsafe {
            let slot = self.slot_ptr(consumer);
            let mut prefix = [0u8; LENGTH_PREFIX];
            ptr::copy_nonoverlapping(slot, prefix.as_mut_ptr(), LENGTH_PREFIX);
            let len = u32::from_le_bytes(prefix) as usize;
            if len > self.max_payload() {
                Err(corrupt(format!("slot length {} exceeds {}", len, self.max_payload())))
            } else {
                out.clear();
                out.extend_from_slice(std::slice::from_raw_parts(slot.add(LENGTH_PREFIX), len));
                Ok(())
            }
        };
        // A corrupt slot is consumed anyway so the ring keeps moving
        self.consumer_pos().store(consumer + 1, Ordering::Release);
        unsafe { libc::pthread_cond_signal(self.not_full()) };
        drop(guard);

        copied.map(|()| true)
    }

    /// Like [`dequeue_into`](Self::dequeue_into) with a fresh buffer.
    pub fn dequeue(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut out = Vec::new();
        Ok(self.dequeue_into(&mut out, timeout)?.then_some(out))
    }

    /// Wakes every waiter; further enqueues fail with `ShutdownInProgress`.
    pub fn close(&self) {
        match self.lock() {
            Ok(guard) => {
                self.closed_flag().store(1, Ordering::Release);
                unsafe {
                    libc::pthread_cond_broadcast(self.not_empty());
                    libc::pthread_cond_broadcast(self.not_full());
                }
                drop(guard);
            }
            Err(err) => {
                warn!("Closing channel without its lock: {}", err);
                self.closed_flag().store(1, Ordering::Release);
            }
        }
    }

    fn header(&self) -> *mut ChannelHeader {
        unsafe { self.region.as_ptr().add(self.offset) }.cast()
    }

    fn mutex(&self) -> *mut libc::pthread_mutex_t {
        unsafe { addr_of_mut!((*self.header()).mutex) }
    }

    fn not_empty(&self) -> *mut libc::pthread_cond_t {
        unsafe { addr_of_mut!((*self.header()).not_empty) }
    }

    fn not_full(&self) -> *mut libc::pthread_cond_t {
        unsafe { addr_of_mut!((*self.header()).not_full) }
    }

    fn producer_pos(&self) -> &AtomicU64 {
        unsafe { &(*self.header()).producer_pos }
    }

    fn consumer_pos(&self) -> &AtomicU64 {
        unsafe { &(*self.header()).consumer_pos }
    }

    fn closed_flag(&self) -> &AtomicU32 {
        unsafe { &(*self.header()).closed }
    }

    // Safety: the returned pointer addresses `slot_size` bytes inside the region.
    unsafe fn slot_ptr(&self, position: u64) -> *mut u8 {
        let index = (position % self.slot_count() as u64) as usize;
        unsafe { self.region.as_ptr().add(self.offset + header_len() + index * self.slot_size()) }
    }

    fn lock(&self) -> Result<ChannelGuard<'_>> {
        match unsafe { libc::pthread_mutex_lock(self.mutex()) } {
            0 => Ok(ChannelGuard { channel: self }),
            libc::EOWNERDEAD => {
                warn!("Previous owner of a channel lock died; recovering");
                unsafe { libc::pthread_mutex_consistent(self.mutex()) };
                Ok(ChannelGuard { channel: self })
            }
            errno => Err(PoolError::from_errno("pthread_mutex_lock", errno)),
        }
    }
}

impl std::fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedChannel")
            .field("slot_count", &self.slot_count())
            .field("slot_size", &self.slot_size())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct ChannelGuard<'a> {
    channel: &'a SharedChannel,
}

impl ChannelGuard<'_> {
    /// Waits on `cond` until signalled or `deadline`; `Ok(false)` on timeout.
    fn wait(&self, cond: *mut libc::pthread_cond_t, deadline: &libc::timespec) -> Result<bool> {
        match unsafe { libc::pthread_cond_timedwait(cond, self.channel.mutex(), deadline) } {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            libc::EOWNERDEAD => {
                unsafe { libc::pthread_mutex_consistent(self.channel.mutex()) };
                Ok(true)
            }
            errno => Err(PoolError::from_errno("pthread_cond_timedwait", errno)),
        }
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        unsafe { libc::pthread_mutex_unlock(self.channel.mutex()) };
    }
}

fn header_len() -> usize {
    align_up(mem::size_of::<ChannelHeader>(), ALIGN)
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn check_bounds(region: &SharedRegion, offset: usize, len: usize) -> Result<()> {
    if offset % ALIGN != 0 || offset.checked_add(len).is_none_or(|end| end > region.len()) {
        return Err(PoolError::InvalidParameter(format!(
            "channel at offset {} ({} bytes) does not fit a region of {} bytes",
            offset,
            len,
            region.len()
        )));
    }
    Ok(())
}

fn corrupt(message: String) -> PoolError {
    PoolError::syscall("shared channel", io::Error::new(io::ErrorKind::InvalidData, message))
}

unsafe fn init_mutex(mutex: *mut libc::pthread_mutex_t) -> Result<()> {
    unsafe {
        let mut attr = mem::zeroed::<libc::pthread_mutexattr_t>();
        check(libc::pthread_mutexattr_init(&mut attr), "pthread_mutexattr_init")?;
        let configured = check(
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
            "pthread_mutexattr_setpshared",
        )
        .and_then(|()| {
            check(
                libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST),
                "pthread_mutexattr_setrobust",
            )
        })
        .and_then(|()| check(libc::pthread_mutex_init(mutex, &attr), "pthread_mutex_init"));
        libc::pthread_mutexattr_destroy(&mut attr);
        configured
    }
}

unsafe fn init_cond(cond: *mut libc::pthread_cond_t) -> Result<()> {
    unsafe {
        let mut attr = mem::zeroed::<libc::pthread_condattr_t>();
        check(libc::pthread_condattr_init(&mut attr), "pthread_condattr_init")?;
        let configured = check(
            libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
            "pthread_condattr_setpshared",
        )
        .and_then(|()| {
            check(
                libc::pthread_condattr_setclock(&mut attr, libc::CLOCK_MONOTONIC),
                "pthread_condattr_setclock",
            )
        })
        .and_then(|()| check(libc::pthread_cond_init(cond, &attr), "pthread_cond_init"));
        libc::pthread_condattr_destroy(&mut attr);
        configured
    }
}

fn check(rc: libc::c_int, context: &str) -> Result<()> {
    if rc == 0 { Ok(()) } else { Err(PoolError::from_errno(context, rc)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn channel(slots: usize, slot_size: usize) -> SharedChannel {
        let len = SharedChannel::footprint(slots, slot_size);
        let region = Arc::new(SharedRegion::anonymous(len).unwrap());
        SharedChannel::init(region, 0, slots, slot_size).unwrap()
    }

    #[test]
    fn test_fifo_and_length_prefix() {
        let ch = channel(4, 64);
        ch.enqueue(b"one", Duration::ZERO).unwrap();
        ch.enqueue(b"", Duration::ZERO).unwrap();
        ch.enqueue(b"three", Duration::ZERO).unwrap();
        assert_eq!(ch.len(), 3);

        assert_eq!(ch.dequeue(Duration::ZERO).unwrap().unwrap(), b"one");
        assert_eq!(ch.dequeue(Duration::ZERO).unwrap().unwrap(), b"");
        assert_eq!(ch.dequeue(Duration::ZERO).unwrap().unwrap(), b"three");
        assert!(ch.dequeue(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let ch = channel(2, 16);
        assert_eq!(ch.max_payload(), 12);
        ch.enqueue(&[7u8; 12], Duration::ZERO).unwrap();
        let err = ch.enqueue(&[7u8; 13], Duration::ZERO).unwrap_err();
        assert!(matches!(err, PoolError::InvalidParameter(_)));
    }

    #[test]
    fn test_full_channel_times_out() {
        let ch = channel(2, 32);
        ch.enqueue(b"a", Duration::ZERO).unwrap();
        ch.enqueue(b"b", Duration::ZERO).unwrap();

        let start = Instant::now();
        let err = ch.enqueue(b"c", Duration::from_millis(50)).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_blocked_consumer_wakes_on_enqueue() {
        let ch = channel(4, 64);
        let consumer = {
            let ch = ch.clone();
            thread::spawn(move || ch.dequeue(Duration::from_secs(5)).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        ch.enqueue(b"wake", Duration::ZERO).unwrap();
        assert_eq!(consumer.join().unwrap().unwrap(), b"wake");
    }

    #[test]
    fn test_close_drains_then_reports_shutdown() {
        let ch = channel(4, 64);
        ch.enqueue(b"last", Duration::ZERO).unwrap();
        ch.close();

        assert!(matches!(ch.enqueue(b"x", Duration::ZERO), Err(PoolError::ShutdownInProgress)));
        assert_eq!(ch.dequeue(Duration::ZERO).unwrap().unwrap(), b"last");
        assert!(matches!(ch.dequeue(Duration::from_secs(1)), Err(PoolError::ShutdownInProgress)));
    }

    #[test]
    fn test_attach_reads_same_ring() {
        let len = SharedChannel::footprint(4, 64);
        let region = Arc::new(SharedRegion::anonymous(len).unwrap());
        let writer = SharedChannel::init(region.clone(), 0, 4, 64).unwrap();
        let reader = SharedChannel::attach(region, 0).unwrap();
        writer.enqueue(b"shared", Duration::ZERO).unwrap();
        assert_eq!(reader.slot_count(), 4);
        assert_eq!(reader.dequeue(Duration::ZERO).unwrap().unwrap(), b"shared");
    }

    #[test]
    fn test_init_rejects_region_too_small() {
        let region = Arc::new(SharedRegion::anonymous(128).unwrap());
        assert!(SharedChannel::init(region, 0, 8, 1024).is_err());
    }
}
