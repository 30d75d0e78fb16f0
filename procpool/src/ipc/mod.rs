//! Master/worker transport over shared memory.
//!
//! - [`shm`]: anonymous and named `MAP_SHARED` regions
//! - [`channel`]: the length-prefixed slot ring guarded by process-shared primitives
//! - [`frame`]: the record format carried in each slot
//! - [`segment`]: one worker's region with its header and both channels

pub mod channel;
pub mod frame;
pub mod segment;
pub mod shm;

pub use channel::SharedChannel;
pub use frame::{ControlOp, Frame, FrameError, ResultFrame};
pub use segment::{segment_name, SegmentFault, WorkerSegment};
pub use shm::SharedRegion;
