//! # Worker Runner
//!
//! The loop executed inside every worker context, forked process or thread.
//! It pulls frames from the segment's task channel, runs the selected handler
//! and writes a result frame back.
//!
//! ## Key Concepts
//! - Heartbeat: a pulse thread refreshes the segment heartbeat every half
//!   interval for as long as the runner lives, including while a handler runs
//! - Shutdown: a `Shutdown` control frame, the segment control word, a closed
//!   channel or the abandon flag end the loop between tasks
//! - Isolation: handler errors and panics become failed results; nothing
//!   inside the runner writes to the log, since forked children must not
//!   touch the master's logging state

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use procpool_api::{ErrorCode, PoolError, Result, TaskFailure, TaskId, TaskState, WorkerId};

use crate::clock::now_ns;
use crate::handler::{HandlerContext, HandlerRegistry, UserContext};
use crate::ipc::frame::{self, ControlOp, Frame, ResultFrame};
use crate::ipc::WorkerSegment;

/// Longest single wait on the task channel before re-checking control state.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything a worker needs to execute tasks.
#[derive(Debug, Clone)]
pub struct WorkerRuntime {
    pub pool_name: String,
    pub handlers: HandlerRegistry,
    pub user_context: Option<UserContext>,
    pub heartbeat_interval: Duration,
}

/// Why a runner returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A `Shutdown` control frame arrived.
    ShutdownFrame,
    /// The segment control word asked for shutdown.
    ControlWord,
    /// The task channel was closed by the master.
    ChannelClosed,
    /// The owner gave up on this worker.
    Abandoned,
}

/// Runs the worker loop over `segment` until told to stop.
pub fn run_worker(runtime: &WorkerRuntime, segment: &WorkerSegment, abandoned: &AtomicBool) -> Result<ExitReason> {
    let pulse_period = (runtime.heartbeat_interval / 2).max(Duration::from_millis(1));
    let finished = AtomicBool::new(false);
    segment.touch_heartbeat();

    thread::scope(|scope| {
        let pulse = scope.spawn(|| {
            while !finished.load(Ordering::Acquire) {
                segment.touch_heartbeat();
                thread::park_timeout(pulse_period);
            }
        });

        let outcome = serve(runtime, segment, abandoned);
        finished.store(true, Ordering::Release);
        pulse.thread().unpark();
        outcome
    })
}

fn serve(runtime: &WorkerRuntime, segment: &WorkerSegment, abandoned: &AtomicBool) -> Result<ExitReason> {
    let worker_id = segment.worker_id();
    let mut inbox = Vec::with_capacity(segment.tasks().max_payload());
    let mut outbox = Vec::new();

    loop {
        if abandoned.load(Ordering::Acquire) {
            return Ok(ExitReason::Abandoned);
        }
        if segment.shutdown_requested() {
            return Ok(ExitReason::ControlWord);
        }

        match segment.tasks().dequeue_into(&mut inbox, POLL_INTERVAL) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(PoolError::ShutdownInProgress) => return Ok(ExitReason::ChannelClosed),
            Err(err) => return Err(err),
        }

        let result = match frame::decode(&inbox) {
            Ok(Frame::Task { task_id, submit_ns: _, handler, payload }) => {
                segment.begin_task(task_id);
                execute(runtime, segment, worker_id, task_id, handler, payload)
            }
            Ok(Frame::Control(ControlOp::Shutdown)) => return Ok(ExitReason::ShutdownFrame),
            Ok(Frame::Control(ControlOp::Ping)) => {
                segment.touch_heartbeat();
                continue;
            }
            // Nothing to answer for frames without a task id
            Ok(Frame::Result(_)) | Err(_) => continue,
        };

        frame::encode_result(&mut outbox, &result);
        let delivered = deliver(segment, &outbox, abandoned);
        segment.end_task();
        if let Some(reason) = delivered? {
            return Ok(reason);
        }
    }
}

// Retries until the master makes room, the worker is told to stop, or the
// channel is closed.
fn deliver(segment: &WorkerSegment, bytes: &[u8], abandoned: &AtomicBool) -> Result<Option<ExitReason>> {
    loop {
        match segment.results().enqueue(bytes, POLL_INTERVAL) {
            Ok(()) => return Ok(None),
            Err(PoolError::Timeout(_)) => {
                if abandoned.load(Ordering::Acquire) {
                    return Ok(Some(ExitReason::Abandoned));
                }
                if segment.shutdown_requested() {
                    return Ok(Some(ExitReason::ControlWord));
                }
            }
            Err(PoolError::ShutdownInProgress) => return Ok(Some(ExitReason::ChannelClosed)),
            Err(err) => return Err(err),
        }
    }
}

/// Runs one task and builds its result frame.
pub fn execute(
    runtime: &WorkerRuntime,
    segment: &WorkerSegment,
    worker_id: WorkerId,
    task_id: TaskId,
    handler_name: Option<&str>,
    payload: &[u8],
) -> ResultFrame {
    let start_ns = now_ns();
    let mut result = ResultFrame {
        task_id,
        state: TaskState::Completed,
        code: 0,
        start_ns,
        end_ns: 0,
        message: None,
        output: None,
    };

    let cancel_hint = segment.cancel_hint();
    if cancel_hint.load(Ordering::Acquire) == task_id {
        result.state = TaskState::Cancelled;
        result.message = Some("Cancelled before start".to_string());
        result.end_ns = now_ns();
        return result;
    }

    let Some(handler) = runtime.handlers.resolve(handler_name) else {
        fail(&mut result, ErrorCode::InvalidParameter.as_i32(), format!("Unknown handler {:?}", handler_name));
        result.end_ns = now_ns();
        return result;
    };

    let ctx = HandlerContext::new(worker_id, task_id, runtime.user_context.as_ref(), cancel_hint);
    match panic::catch_unwind(AssertUnwindSafe(|| handler(payload, &ctx))) {
        Ok(Ok(output)) => result.output = Some(output),
        Ok(Err(err)) => match err.downcast_ref::<TaskFailure>() {
            Some(failure) => fail(&mut result, failure.code, failure.message.clone()),
            None => fail(&mut result, ErrorCode::HandlerFailed.as_i32(), format!("{:#}", err)),
        },
        Err(panic) => fail(
            &mut result,
            ErrorCode::HandlerFailed.as_i32(),
            format!("Handler panicked: {}", panic_message(panic.as_ref())),
        ),
    }
    result.end_ns = now_ns();

    let capacity = segment.results().max_payload();
    if result.encoded_len() > capacity {
        let produced = result.output.take().map_or(0, |o| o.len());
        fail(
            &mut result,
            ErrorCode::InvalidParameter.as_i32(),
            format!("Output of {} bytes exceeds slot capacity of {} bytes", produced, capacity),
        );
    }
    result
}

fn fail(result: &mut ResultFrame, code: i32, message: String) {
    result.state = TaskState::Failed;
    result.code = code;
    result.message = Some(message);
    result.output = None;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
