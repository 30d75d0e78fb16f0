use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use procpool_api::{PoolError, Result, TaskId, WorkerId};
use thiserror::Error;
use tracing::{debug, warn};

use super::channel::SharedChannel;
use super::shm::{is_already_exists, SharedRegion};
use crate::clock::now_ns;

/// "PPOL"
pub const SEGMENT_MAGIC: u32 = 0x5050_4F4C;
pub const SEGMENT_VERSION: u32 = 2;

const CONTROL_SHUTDOWN: u32 = 1;
const NO_TASK: u64 = 0;

#[repr(C)]
struct SegmentHeader {
    magic: AtomicU32,
    version: u32,
    slot_count: u64,
    slot_size: u64,
    worker_id: u32,
    pid: AtomicU32,
    heartbeat_ns: AtomicU64,
    control: AtomicU32,
    cancel_task: AtomicU64,
    tasks_processed: AtomicU64,
    current_task: AtomicU64,
}

/// Reasons an existing segment cannot be attached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentFault {
    #[error("region of {len} bytes is smaller than a segment header")]
    TooSmall { len: usize },

    #[error("bad magic {found:#010x}")]
    BadMagic { found: u32 },

    #[error("unsupported version {found}")]
    BadVersion { found: u32 },

    #[error("geometry {slot_count} x {slot_size} does not fit {len} bytes")]
    BadGeometry { slot_count: u64, slot_size: u64, len: usize },
}

impl From<SegmentFault> for PoolError {
    fn from(fault: SegmentFault) -> Self {
        PoolError::syscall("attach worker segment", io::Error::new(io::ErrorKind::InvalidData, fault))
    }
}

/// Shared memory owned by one worker: a header with liveness and control
/// words, a task channel (master to worker) and a result channel (worker to
/// master).
#[derive(Clone)]
pub struct WorkerSegment {
    region: Arc<SharedRegion>,
    tasks: SharedChannel,
    results: SharedChannel,
}

/// Shared memory object name for a worker of a pool.
pub fn segment_name(pool_name: &str, worker_id: WorkerId) -> String {
    format!("/{}_worker_{}", pool_name, worker_id)
}

impl WorkerSegment {
    /// Total bytes needed for this channel geometry.
    pub fn footprint(slot_count: usize, slot_size: usize) -> usize {
        header_len() + 2 * SharedChannel::footprint(slot_count, slot_size)
    }

    /// Creates the named segment for `worker_id`.
    ///
    /// An object already under that name is unlinked first and never reused:
    /// it may still be mapped by the supervisor of the worker being replaced,
    /// and closing that one must not reach the new worker.
    pub fn create_named(pool_name: &str, worker_id: WorkerId, slot_count: usize, slot_size: usize) -> Result<Self> {
        let name = segment_name(pool_name, worker_id);
        let len = Self::footprint(slot_count, slot_size);

        let region = match SharedRegion::create(&name, len) {
            Ok(region) => region,
            Err(err) if is_already_exists(&err) => {
                match SharedRegion::open(&name) {
                    Ok(stale) => match Self::validate(&stale) {
                        Ok(_) => debug!("Replacing leftover segment {}", name),
                        Err(fault) => warn!("Segment {} is corrupt ({}); recreating", name, fault),
                    },
                    Err(err) => warn!("Segment {} cannot be opened ({}); recreating", name, err),
                }
                SharedRegion::unlink(&name)?;
                SharedRegion::create(&name, len)?
            }
            Err(err) => return Err(err),
        };

        Self::initialise(region, worker_id, slot_count, slot_size)
    }

    /// Creates a segment on an anonymous mapping, shared only through `fork`
    /// or within the process.
    pub fn create_anonymous(worker_id: WorkerId, slot_count: usize, slot_size: usize) -> Result<Self> {
        let region = SharedRegion::anonymous(Self::footprint(slot_count, slot_size))?;
        Self::initialise(region, worker_id, slot_count, slot_size)
    }

    /// Attaches to a segment created by another process.
    pub fn attach(name: &str) -> Result<Self> {
        let region = SharedRegion::open(name)?;
        let (slot_count, slot_size) = Self::validate(&region)?;
        let region = Arc::new(region);
        let tasks = SharedChannel::attach(region.clone(), header_len())?;
        let results = SharedChannel::attach(region.clone(), header_len() + SharedChannel::footprint(slot_count, slot_size))?;
        Ok(Self { region, tasks, results })
    }

    fn initialise(region: SharedRegion, worker_id: WorkerId, slot_count: usize, slot_size: usize) -> Result<Self> {
        let region = Arc::new(region);
        let header = region.as_ptr().cast::<SegmentHeader>();
        unsafe {
            // Readers only trust a segment once the magic is published
            (*header).magic.store(0, Ordering::Release);
            ptr::write(
                header,
                SegmentHeader {
                    magic: AtomicU32::new(0),
                    version: SEGMENT_VERSION,
                    slot_count: slot_count as u64,
                    slot_size: slot_size as u64,
                    worker_id,
                    pid: AtomicU32::new(0),
                    heartbeat_ns: AtomicU64::new(now_ns()),
                    control: AtomicU32::new(0),
                    cancel_task: AtomicU64::new(NO_TASK),
                    tasks_processed: AtomicU64::new(0),
                    current_task: AtomicU64::new(NO_TASK),
                },
            );
        }

        let tasks = SharedChannel::init(region.clone(), header_len(), slot_count, slot_size)?;
        let results = SharedChannel::init(
            region.clone(),
            header_len() + SharedChannel::footprint(slot_count, slot_size),
            slot_count,
            slot_size,
        )?;

        unsafe { (*header).magic.store(SEGMENT_MAGIC, Ordering::Release) };
        Ok(Self { region, tasks, results })
    }

    fn validate(region: &SharedRegion) -> std::result::Result<(usize, usize), SegmentFault> {
        if region.len() < header_len() {
            return Err(SegmentFault::TooSmall { len: region.len() });
        }
        let header = unsafe { &*region.as_ptr().cast::<SegmentHeader>() };
        let magic = header.magic.load(Ordering::Acquire);
        if magic != SEGMENT_MAGIC {
            return Err(SegmentFault::BadMagic { found: magic });
        }
        if header.version != SEGMENT_VERSION {
            return Err(SegmentFault::BadVersion { found: header.version });
        }

        let (slot_count, slot_size) = (header.slot_count, header.slot_size);
        let fits = usize::try_from(slot_count)
            .ok()
            .zip(usize::try_from(slot_size).ok())
            .filter(|(c, s)| *c > 0 && *s > 0 && c.checked_mul(*s).is_some())
            .is_some_and(|(c, s)| Self::footprint(c, s) <= region.len());
        if !fits {
            return Err(SegmentFault::BadGeometry { slot_count, slot_size, len: region.len() });
        }
        Ok((slot_count as usize, slot_size as usize))
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*self.region.as_ptr().cast::<SegmentHeader>() }
    }

    /// Master to worker.
    pub fn tasks(&self) -> &SharedChannel {
        &self.tasks
    }

    /// Worker to master.
    pub fn results(&self) -> &SharedChannel {
        &self.results
    }

    pub fn name(&self) -> Option<&str> {
        self.region.name()
    }

    pub fn worker_id(&self) -> WorkerId {
        self.header().worker_id
    }

    pub fn set_pid(&self, pid: u32) {
        self.header().pid.store(pid, Ordering::Release);
    }

    pub fn pid(&self) -> Option<u32> {
        Some(self.header().pid.load(Ordering::Acquire)).filter(|pid| *pid != 0)
    }

    pub fn touch_heartbeat(&self) {
        self.header().heartbeat_ns.store(now_ns(), Ordering::Release);
    }

    pub fn heartbeat_ns(&self) -> u64 {
        self.header().heartbeat_ns.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.header().control.store(CONTROL_SHUTDOWN, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.header().control.load(Ordering::Acquire) == CONTROL_SHUTDOWN
    }

    /// Asks the worker to skip or abandon `task_id`.
    pub fn post_cancel(&self, task_id: TaskId) {
        self.header().cancel_task.store(task_id, Ordering::Release);
    }

    /// Word the worker compares against the id of the task it is running.
    pub fn cancel_hint(&self) -> &AtomicU64 {
        &self.header().cancel_task
    }

    /// Worker-side bookkeeping when a task starts.
    pub fn begin_task(&self, task_id: TaskId) {
        self.header().current_task.store(task_id, Ordering::Release);
    }

    /// Worker-side bookkeeping when a task's result has been produced.
    pub fn end_task(&self) {
        self.header().current_task.store(NO_TASK, Ordering::Release);
        self.header().tasks_processed.fetch_add(1, Ordering::AcqRel);
    }

    /// Task the worker reports as executing.
    pub fn current_task(&self) -> Option<TaskId> {
        Some(self.header().current_task.load(Ordering::Acquire)).filter(|id| *id != NO_TASK)
    }

    pub fn tasks_processed(&self) -> u64 {
        self.header().tasks_processed.load(Ordering::Acquire)
    }

    /// Closes both channels, waking anything blocked on them.
    pub fn close(&self) {
        self.tasks.close();
        self.results.close();
    }
}

impl std::fmt::Debug for WorkerSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSegment")
            .field("name", &self.name())
            .field("worker_id", &self.worker_id())
            .field("pid", &self.pid())
            .field("tasks", &self.tasks)
            .field("results", &self.results)
            .finish()
    }
}

fn header_len() -> usize {
    (mem::size_of::<SegmentHeader>() + 63) & !63
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool_name() -> String {
        format!("segtest-{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
    }

    #[test]
    fn test_segment_name_format() {
        assert_eq!(segment_name("images", 3), "/images_worker_3");
    }

    #[test]
    fn test_attach_sees_master_writes() {
        let pool = pool_name();
        let master = WorkerSegment::create_named(&pool, 1, 4, 256).unwrap();
        master.set_pid(4242);
        master.tasks().enqueue(b"job", Duration::ZERO).unwrap();

        let worker = WorkerSegment::attach(&segment_name(&pool, 1)).unwrap();
        assert_eq!(worker.worker_id(), 1);
        assert_eq!(worker.pid(), Some(4242));
        assert_eq!(worker.tasks().dequeue(Duration::ZERO).unwrap().unwrap(), b"job");

        worker.begin_task(17);
        assert_eq!(master.current_task(), Some(17));
        worker.end_task();
        assert_eq!(master.current_task(), None);
        assert_eq!(master.tasks_processed(), 1);

        master.request_shutdown();
        assert!(worker.shutdown_requested());
    }

    #[test]
    fn test_attach_rejects_foreign_region() {
        let name = format!("/{}-foreign", pool_name());
        let mut region = SharedRegion::create(&name, 4096).unwrap();
        region.claim_name();
        unsafe { *region.as_ptr().cast::<u32>() = 0xDEAD_BEEF };

        let err = WorkerSegment::attach(&name).unwrap_err();
        assert!(matches!(err, PoolError::SystemCall { .. }));
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_create_replaces_corrupt_leftover() {
        let pool = pool_name();
        let name = segment_name(&pool, 0);

        let junk = SharedRegion::create(&name, 64).unwrap();
        let fresh = WorkerSegment::create_named(&pool, 0, 2, 128).unwrap();
        assert_eq!(fresh.tasks().slot_count(), 2);
        drop(junk);
        assert!(WorkerSegment::attach(&name).is_ok());
    }

    #[test]
    fn test_replacement_survives_previous_segment() {
        let pool = pool_name();
        let name = segment_name(&pool, 0);

        let previous = WorkerSegment::create_named(&pool, 0, 2, 128).unwrap();
        previous.tasks().enqueue(b"old work", Duration::ZERO).unwrap();
        let replacement = WorkerSegment::create_named(&pool, 0, 2, 128).unwrap();
        assert!(replacement.tasks().is_empty());
        assert_eq!(previous.tasks().len(), 1);

        previous.close();
        drop(previous);
        assert!(!replacement.tasks().is_closed());
        assert!(!replacement.results().is_closed());
        replacement.tasks().enqueue(b"new work", Duration::ZERO).unwrap();

        let attached = WorkerSegment::attach(&name).unwrap();
        assert_eq!(attached.tasks().dequeue(Duration::ZERO).unwrap().unwrap(), b"new work");
    }

    #[test]
    fn test_cancel_hint_round_trip() {
        let segment = WorkerSegment::create_anonymous(5, 2, 128).unwrap();
        assert_eq!(segment.cancel_hint().load(Ordering::Acquire), 0);
        segment.post_cancel(99);
        assert_eq!(segment.cancel_hint().load(Ordering::Acquire), 99);
        assert!(segment.name().is_none());
    }
}
