//! Record format carried inside shared-channel slots.
//!
//! All integers are little-endian. Layouts:
//!
//! ```text
//! Task    | kind=1 | 0 | handler_len:u16 | task_id:u64 | submit_ns:u64 | handler | payload
//! Control | kind=2 | op:u8
//! Result  | kind=3 | state:u8 | has_output:u8 | 0 | code:i32 | task_id:u64
//!         | start_ns:u64 | end_ns:u64 | msg_len:u16 | message | output
//! ```

use procpool_api::{PoolError, TaskId, TaskState};
use thiserror::Error;

const KIND_TASK: u8 = 1;
const KIND_CONTROL: u8 = 2;
const KIND_RESULT: u8 = 3;

/// Fixed bytes ahead of the handler name in a task frame.
pub const TASK_HEADER_LEN: usize = 20;

/// Fixed bytes ahead of the message in a result frame.
pub const RESULT_HEADER_LEN: usize = 34;

/// Longest error message carried back from a worker.
pub const MAX_MESSAGE_LEN: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("unknown control op {0}")]
    UnknownControl(u8),

    #[error("invalid task state {0}")]
    InvalidState(u8),

    #[error("frame text is not UTF-8")]
    InvalidUtf8,
}

impl From<FrameError> for PoolError {
    fn from(err: FrameError) -> Self {
        PoolError::Other(anyhow::Error::new(err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOp {
    Shutdown = 1,
    Ping = 2,
}

/// Outcome reported by a worker for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFrame {
    pub task_id: TaskId,
    pub state: TaskState,
    pub code: i32,
    pub start_ns: u64,
    pub end_ns: u64,
    pub message: Option<String>,
    pub output: Option<Vec<u8>>,
}

impl ResultFrame {
    /// Encoded size, with the message already capped.
    pub fn encoded_len(&self) -> usize {
        let message = self.message.as_deref().map_or(0, |m| cap_message(m).len());
        RESULT_HEADER_LEN + message + self.output.as_ref().map_or(0, Vec::len)
    }
}

/// A decoded frame borrowing from the slot buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Task { task_id: TaskId, submit_ns: u64, handler: Option<&'a str>, payload: &'a [u8] },
    Control(ControlOp),
    Result(ResultFrame),
}

/// Size of a task frame for this handler name and payload.
pub fn task_frame_len(handler: Option<&str>, payload_len: usize) -> usize {
    TASK_HEADER_LEN + handler.map_or(0, str::len) + payload_len
}

pub fn encode_task(buf: &mut Vec<u8>, task_id: TaskId, submit_ns: u64, handler: Option<&str>, payload: &[u8]) {
    let handler = handler.unwrap_or("");
    buf.clear();
    buf.reserve(task_frame_len(Some(handler), payload.len()));
    buf.push(KIND_TASK);
    buf.push(0);
    buf.extend_from_slice(&(handler.len() as u16).to_le_bytes());
    buf.extend_from_slice(&task_id.to_le_bytes());
    buf.extend_from_slice(&submit_ns.to_le_bytes());
    buf.extend_from_slice(handler.as_bytes());
    buf.extend_from_slice(payload);
}

pub fn encode_control(buf: &mut Vec<u8>, op: ControlOp) {
    buf.clear();
    buf.push(KIND_CONTROL);
    buf.push(op as u8);
}

pub fn encode_result(buf: &mut Vec<u8>, result: &ResultFrame) {
    let message = result.message.as_deref().map(cap_message).unwrap_or("");
    buf.clear();
    buf.reserve(result.encoded_len());
    buf.push(KIND_RESULT);
    buf.push(result.state as u8);
    buf.push(u8::from(result.output.is_some()));
    buf.push(0);
    buf.extend_from_slice(&result.code.to_le_bytes());
    buf.extend_from_slice(&result.task_id.to_le_bytes());
    buf.extend_from_slice(&result.start_ns.to_le_bytes());
    buf.extend_from_slice(&result.end_ns.to_le_bytes());
    buf.extend_from_slice(&(message.len() as u16).to_le_bytes());
    buf.extend_from_slice(message.as_bytes());
    if let Some(output) = &result.output {
        buf.extend_from_slice(output);
    }
}

pub fn decode(bytes: &[u8]) -> Result<Frame<'_>, FrameError> {
    let mut reader = Reader { bytes, pos: 0 };
    match reader.u8()? {
        KIND_TASK => {
            reader.u8()?;
            let handler_len = reader.u16()? as usize;
            let task_id = reader.u64()?;
            let submit_ns = reader.u64()?;
            let handler = reader.str(handler_len)?;
            Ok(Frame::Task {
                task_id,
                submit_ns,
                handler: (!handler.is_empty()).then_some(handler),
                payload: reader.rest(),
            })
        }
        KIND_CONTROL => match reader.u8()? {
            1 => Ok(Frame::Control(ControlOp::Shutdown)),
            2 => Ok(Frame::Control(ControlOp::Ping)),
            op => Err(FrameError::UnknownControl(op)),
        },
        KIND_RESULT => {
            let raw_state = reader.u8()?;
            let state = TaskState::from_u8(raw_state).ok_or(FrameError::InvalidState(raw_state))?;
            let has_output = reader.u8()? != 0;
            reader.u8()?;
            let code = reader.u32()? as i32;
            let task_id = reader.u64()?;
            let start_ns = reader.u64()?;
            let end_ns = reader.u64()?;
            let msg_len = reader.u16()? as usize;
            let message = reader.str(msg_len)?;
            let output = reader.rest();
            Ok(Frame::Result(ResultFrame {
                task_id,
                state,
                code,
                start_ns,
                end_ns,
                message: (!message.is_empty()).then(|| message.to_string()),
                output: has_output.then(|| output.to_vec()),
            }))
        }
        kind => Err(FrameError::UnknownKind(kind)),
    }
}

fn cap_message(message: &str) -> &str {
    if message.len() <= MAX_MESSAGE_LEN {
        return message;
    }
    let mut end = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(FrameError::Truncated { needed: end, available: self.bytes.len() });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(raw))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn str(&mut self, len: usize) -> Result<&'a str, FrameError> {
        std::str::from_utf8(self.take(len)?).map_err(|_| FrameError::InvalidUtf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        rest
    }
}
