// Tests for the task, worker and stats data model

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use procpool_api::*;

#[test]
fn test_task_desc_builder() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let desc = TaskDesc::new("resize-image")
        .with_priority(TaskPriority::High)
        .with_handler("thumbnail")
        .with_timeout(Duration::from_secs(2))
        .with_trace_id("req-17")
        .with_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

    assert_eq!(desc.name, "resize-image");
    assert_eq!(desc.priority, TaskPriority::High);
    assert_eq!(desc.handler.as_deref(), Some("thumbnail"));
    assert_eq!(desc.timeout, Some(Duration::from_secs(2)));
    assert_eq!(desc.trace_id.as_deref(), Some("req-17"));

    let result = TaskResult {
        task_id: 7,
        state: TaskState::Completed,
        code: 0,
        message: None,
        output: Some(vec![1, 2, 3]),
        worker_id: Some(1),
        submit_ns: 10,
        start_ns: 20,
        end_ns: 30,
    };
    (desc.callback.as_ref().unwrap())(&result);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(result.is_success());
    assert_eq!(result.error_code(), Some(ErrorCode::Success));

    let debug = format!("{:?}", desc);
    assert!(debug.contains("has_callback: true"));
}

#[test]
fn test_worker_state_machine() {
    assert!(WorkerState::Created.can_transition_to(WorkerState::Starting));
    assert!(WorkerState::Running.can_transition_to(WorkerState::Error));
    assert!(WorkerState::Error.can_transition_to(WorkerState::Created));
    assert!(!WorkerState::Stopped.can_transition_to(WorkerState::Running));
    assert!(!WorkerState::Running.can_transition_to(WorkerState::Created));
    assert_eq!(WorkerState::from_u8(2), Some(WorkerState::Running));
    assert_eq!(WorkerState::from_u8(9), None);
}

#[test]
fn test_worker_info_idle() {
    let mut info = WorkerInfo {
        worker_id: 0,
        pid: Some(100),
        state: WorkerState::Running,
        tasks_processed: 3,
        last_heartbeat_ns: 0,
        current_task_id: None,
        restarts: 0,
    };
    assert!(info.is_idle());
    info.current_task_id = Some(5);
    assert!(!info.is_idle());
}

#[test]
fn test_stats_serialize_and_totals() {
    let mut stats = PoolStats::empty(PoolState::Running);
    stats.total_completed = 5;
    stats.total_failed = 1;
    stats.total_cancelled = 2;
    assert_eq!(stats.total_finished(), 8);

    let json = serde_json::to_string(&stats).unwrap();
    assert!(json.contains("\"total_completed\":5"));
    assert!(json.contains("\"state\":\"Running\""));
}

#[test]
fn test_version() {
    assert_eq!(version(), format!("{}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH));
    assert_eq!(MAX_WORKERS, 128);
    assert_eq!(MAX_TASK_DATA_SIZE, 65536);
    assert!(DEFAULT_QUEUE_SIZE.is_power_of_two());
}
