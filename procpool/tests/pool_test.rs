// Integration tests for the pool manager with thread-isolated workers


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use procpool::{
    handler_fn, wait_all, wait_all_async, ErrorCode, PoolError, PoolManager, PoolSignal, PoolState,
    RuntimeTuning, TaskDesc, TaskState, WorkerState,
};
use test_helpers::*;

fn fib_task() -> TaskDesc {
    TaskDesc::new("fibonacci").with_handler("fibonacci")
}

fn sleep_task() -> TaskDesc {
    TaskDesc::new("sleep").with_handler("sleep")
}

#[test]
fn test_active_workers_equal_min_after_start() {
    let pool = started_pool(test_config("pool-min", 3, 5));
    let stats = pool.get_stats();
    assert_eq!(stats.state, PoolState::Running);
    assert_eq!(stats.active_workers, 3);
    assert_eq!(stats.idle_workers, 3);

    let workers = pool.get_workers();
    assert_eq!(workers.iter().map(|w| w.worker_id).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(workers.iter().all(|w| w.state == WorkerState::Running && w.pid.is_none()));
    pool.stop(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_fibonacci_scenario() {
    let pool = started_pool(test_config("pool-fib", 2, 4));
    let inputs = [5u64, 10, 15, 20, 25];
    let futures: Vec<_> = inputs
        .iter()
        .map(|n| pool.submit_async(fib_task(), &encode_u64(*n)).unwrap())
        .collect();

    let results = wait_all(&futures, Some(RESULT_TIMEOUT)).unwrap();
    let values: Vec<u64> = results.iter().map(|r| decode_u64(r.output_bytes())).collect();
    assert_eq!(values, vec![5, 55, 610, 6765, 75025]);
    assert!(results.iter().all(|r| r.state == TaskState::Completed && r.worker_id.is_some()));

    assert!(wait_until(Duration::from_secs(2), || pool.get_stats().total_completed == 5));
    let stats = pool.get_stats();
    assert_eq!(stats.total_submitted, 5);
    assert_eq!(stats.total_failed, 0);
    assert_eq!(stats.execution_latency.count, 5);
    pool.stop(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_handler_round_trip() {
    let pool = started_pool(test_config("pool-echo", 1, 1));
    let result = pool.submit_sync(TaskDesc::new("echo"), b"round trip", Some(RESULT_TIMEOUT)).unwrap();
    assert!(result.is_success());
    assert_eq!(result.output_bytes(), b"round trip");
    assert_eq!(result.code, 0);
    assert!(result.end_ns >= result.start_ns);
}

#[test]
fn test_submissions_below_capacity_never_queue_full() {
    let pool = started_pool(test_config("pool-capacity", 1, 1));
    let blocker = pool.submit_async(sleep_task(), &encode_u64(2_000)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || blocker.state() == TaskState::Running));

    // queue_size 16 leaves 15 usable slots
    let queued: Vec<_> = (0..15)
        .map(|i| pool.submit_async(TaskDesc::new("echo"), &[i as u8]).unwrap())
        .collect();
    match pool.submit_async(TaskDesc::new("echo"), b"overflow") {
        Err(PoolError::QueueFull { capacity }) => assert_eq!(capacity, 15),
        other => panic!("expected QueueFull, got {:?}", other.map(|f| f.task_id())),
    }
    assert_eq!(pool.get_stats().pending_tasks, 15);

    blocker.cancel().unwrap();
    let results = wait_all(&queued, Some(RESULT_TIMEOUT)).unwrap();
    assert_eq!(results.len(), 15);
}

#[test]
fn test_cancel_pending_task_is_never_dispatched() {
    let pool = started_pool(test_config("pool-cancel", 1, 1));
    let blocker = pool.submit_async(sleep_task(), &encode_u64(300)).unwrap();
    let pending = pool.submit_async(TaskDesc::new("echo"), b"never").unwrap();

    pending.cancel().unwrap();
    assert_eq!(pending.state(), TaskState::Cancelled);
    assert!(matches!(pending.cancel(), Err(PoolError::InvalidParameter(_))));

    assert_eq!(blocker.wait(Some(RESULT_TIMEOUT)).unwrap().state, TaskState::Completed);
    let result = pending.wait(Some(Duration::ZERO)).unwrap();
    assert_eq!(result.state, TaskState::Cancelled);
    assert_eq!(result.code, 0);
    assert_eq!(result.worker_id, None);

    // Only the blocker ever reaches the worker
    let follow_up = pool.submit_sync(TaskDesc::new("echo"), b"next", Some(RESULT_TIMEOUT)).unwrap();
    assert!(follow_up.is_success());
    assert!(wait_until(Duration::from_secs(2), || pool.get_worker(0).unwrap().tasks_processed == 2));
    assert_eq!(pool.get_stats().total_cancelled, 1);
}

#[test]
fn test_cancel_running_task_frees_worker() {
    let pool = started_pool(test_config("pool-cancel-running", 1, 1));
    let long = pool.submit_async(sleep_task(), &encode_u64(10_000)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || long.state() == TaskState::Running));

    long.cancel().unwrap();
    assert_eq!(long.state(), TaskState::Cancelled);

    let started = Instant::now();
    let next = pool.submit_sync(TaskDesc::new("echo"), b"after", Some(RESULT_TIMEOUT)).unwrap();
    assert!(next.is_success());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_wait_timeout_leaves_task_running() {
    let pool = started_pool(test_config("pool-wait", 1, 1));
    let future = pool.submit_async(sleep_task(), &encode_u64(300)).unwrap();

    match future.wait(Some(Duration::from_millis(50))) {
        Err(PoolError::Timeout(limit)) => assert_eq!(limit, Duration::from_millis(50)),
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert!(!future.is_done());

    let result = future.wait(None).unwrap();
    assert_eq!(result.state, TaskState::Completed);
    assert_eq!(result.output_bytes(), b"slept");
}

#[test]
fn test_submit_sync_uses_descriptor_timeout() {
    let pool = started_pool(test_config("pool-desc-timeout", 1, 1));
    let desc = sleep_task().with_timeout(Duration::from_millis(50));
    let err = pool.submit_sync(desc, &encode_u64(500), None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
}

#[test]
fn test_task_timeout_expires_running_task() {
    let config = test_config("pool-expiry", 1, 1).with_task_timeout(Duration::from_millis(300));
    let pool = started_pool(config);

    let result = pool
        .submit_async(sleep_task(), &encode_u64(3_000))
        .unwrap()
        .wait(Some(RESULT_TIMEOUT))
        .unwrap();
    assert_eq!(result.state, TaskState::TimedOut);
    assert_eq!(result.error_code(), Some(ErrorCode::Timeout));
    assert_eq!(pool.get_stats().total_timed_out, 1);
}

#[test]
fn test_handler_failures_surface_in_results() {
    let pool = started_pool(test_config("pool-failures", 1, 1));

    let failed = pool
        .submit_sync(TaskDesc::new("fail").with_handler("fail"), b"", Some(RESULT_TIMEOUT))
        .unwrap();
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.code, 42);

    let panicked = pool
        .submit_sync(TaskDesc::new("panic").with_handler("panic"), b"", Some(RESULT_TIMEOUT))
        .unwrap();
    assert_eq!(panicked.state, TaskState::Failed);
    assert_eq!(panicked.error_code(), Some(ErrorCode::HandlerFailed));

    // The worker survives both
    assert!(pool.submit_sync(TaskDesc::new("echo"), b"ok", Some(RESULT_TIMEOUT)).unwrap().is_success());
    assert!(wait_until(Duration::from_secs(2), || pool.get_stats().total_failed == 2));
    assert_eq!(pool.get_stats().total_restarts, 0);
}

#[test]
fn test_invalid_submissions_are_rejected() {
    let pool = started_pool(test_config("pool-invalid", 1, 1));

    let unknown = pool.submit_async(TaskDesc::new("x").with_handler("missing"), b"");
    assert!(matches!(unknown, Err(PoolError::InvalidParameter(_))));

    let oversized = vec![0u8; pool.config().max_input_size(0) + 1];
    assert!(matches!(
        pool.submit_async(TaskDesc::new("big"), &oversized),
        Err(PoolError::InvalidParameter(_))
    ));
    assert_eq!(pool.get_stats().total_submitted, 0);
}

#[test]
fn test_submit_batch_is_all_or_nothing() {
    let pool = started_pool(test_config("pool-batch", 1, 2));

    let too_many: Vec<_> = (0..20u64).map(|n| (fib_task(), encode_u64(n))).collect();
    assert!(matches!(pool.submit_batch(too_many), Err(PoolError::QueueFull { .. })));
    assert_eq!(pool.get_stats().total_submitted, 0);

    let batch: Vec<_> = (1..=5u64).map(|n| (fib_task(), encode_u64(n))).collect();
    let futures = pool.submit_batch(batch).unwrap();
    let values: Vec<u64> = wait_all(&futures, Some(RESULT_TIMEOUT))
        .unwrap()
        .iter()
        .map(|r| decode_u64(r.output_bytes()))
        .collect();
    assert_eq!(values, vec![1, 1, 2, 3, 5]);
    assert!(pool.submit_batch(Vec::<(TaskDesc, Vec<u8>)>::new()).unwrap().is_empty());
}

#[test]
fn test_resize_converges_within_bounds() {
    let pool = started_pool(test_config("pool-resize", 1, 3));

    pool.resize(3).unwrap();
    assert_eq!(pool.get_stats().active_workers, 3);

    pool.resize(10).unwrap();
    assert_eq!(pool.get_stats().active_workers, 3);

    pool.resize(0).unwrap();
    let stats = pool.get_stats();
    assert_eq!(stats.active_workers, 1);
    assert_eq!(pool.get_workers().iter().map(|w| w.worker_id).collect::<Vec<_>>(), vec![0]);

    pool.resize(2).unwrap();
    assert_eq!(pool.get_workers().iter().map(|w| w.worker_id).collect::<Vec<_>>(), vec![0, 1]);
}

#[test]
fn test_shrink_waits_for_in_flight_work() {
    let pool = started_pool(test_config("pool-shrink", 1, 2));
    pool.resize(2).unwrap();

    let first = pool.submit_async(sleep_task(), &encode_u64(300)).unwrap();
    let second = pool.submit_async(sleep_task(), &encode_u64(300)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        first.state() == TaskState::Running && second.state() == TaskState::Running
    }));

    pool.resize(1).unwrap();
    assert_eq!(pool.get_stats().active_workers, 1);
    for future in [first, second] {
        assert_eq!(future.wait(Some(RESULT_TIMEOUT)).unwrap().state, TaskState::Completed);
    }
}

#[test]
fn test_shrink_during_dispatch_finishes_every_task() {
    let pool = started_pool(test_config("pool-shrink-race", 1, 4));
    pool.resize(4).unwrap();

    let futures = std::thread::scope(|scope| {
        let submitter = scope.spawn(|| {
            let mut futures = Vec::new();
            for n in 0..300u64 {
                loop {
                    match pool.submit_async(fib_task(), &encode_u64(n % 40)) {
                        Ok(future) => break futures.push(future),
                        Err(PoolError::QueueFull { .. }) => std::thread::sleep(Duration::from_millis(1)),
                        Err(err) => panic!("submit failed: {}", err),
                    }
                }
            }
            futures
        });

        for target in [1, 4, 2, 4, 1] {
            std::thread::sleep(Duration::from_millis(5));
            pool.resize(target).unwrap();
        }
        submitter.join().unwrap()
    });

    let results = wait_all(&futures, Some(RESULT_TIMEOUT)).unwrap();
    assert_eq!(results.len(), 300);
    for (n, result) in (0..300u64).zip(&results) {
        assert_eq!(result.state, TaskState::Completed);
        assert_eq!(decode_u64(result.output_bytes()), fibonacci(n % 40));
    }
    assert_eq!(pool.get_stats().active_workers, 1);
    assert_eq!(pool.get_stats().total_failed, 0);
}

#[test]
fn test_reload_applies_task_timeout() {
    let pool = started_pool(test_config("pool-reload", 1, 1).with_task_timeout(Duration::ZERO));
    pool.reload(RuntimeTuning { task_timeout: Some(Duration::from_millis(200)), ..Default::default() })
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || pool.events_processed() > 0));

    let result = pool
        .submit_async(sleep_task(), &encode_u64(5_000))
        .unwrap()
        .wait(Some(RESULT_TIMEOUT))
        .unwrap();
    assert_eq!(result.state, TaskState::TimedOut);
}

#[test]
fn test_force_cleanup_releases_buffers() {
    let pool = started_pool(test_config("pool-cleanup", 1, 1));
    for _ in 0..4 {
        pool.submit_sync(TaskDesc::new("echo"), &[1u8; 128], Some(RESULT_TIMEOUT)).unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || pool.allocator_stats().free_buffers > 0));

    pool.control(procpool::ControlCommand::ForceCleanup).unwrap();
    assert!(wait_until(Duration::from_secs(2), || pool.allocator_stats().free_buffers == 0));
    assert_eq!(pool.get_stats().execution_latency.count, 0);
}

#[test]
fn test_auto_scaling_grows_and_shrinks() {
    let config = test_config("pool-autoscale", 1, 3)
        .with_auto_scaling(true)
        .with_idle_timeout(Duration::from_millis(500));
    let pool = started_pool(config);

    let futures: Vec<_> = (0..6)
        .map(|_| pool.submit_async(sleep_task(), &encode_u64(1_500)).unwrap())
        .collect();
    assert!(wait_until(Duration::from_secs(5), || pool.get_stats().active_workers > 1));

    wait_all(&futures, Some(Duration::from_secs(20))).unwrap();
    assert!(wait_until(Duration::from_secs(10), || pool.get_stats().active_workers == 1));
}

#[test]
fn test_callback_and_user_context() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = test_config("pool-context", 1, 1)
        .with_user_context(Arc::new(7u64))
        .with_handler(
            "scale",
            handler_fn(|input, ctx| {
                let factor = *ctx.user_context::<u64>().unwrap();
                Ok(encode_u64(decode_u64(input) * factor))
            }),
        );
    let pool = started_pool(config);

    let seen = calls.clone();
    let desc = TaskDesc::new("scale")
        .with_handler("scale")
        .with_trace_id("trace-1")
        .with_callback(move |result| {
            assert_eq!(result.state, TaskState::Completed);
            seen.fetch_add(1, Ordering::SeqCst);
        });
    let result = pool.submit_sync(desc, &encode_u64(6), Some(RESULT_TIMEOUT)).unwrap();
    assert_eq!(decode_u64(result.output_bytes()), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_debug_mode_is_reported() {
    let pool = started_pool(test_config("pool-debug", 1, 1));
    assert!(!pool.get_stats().debug_mode);
    pool.set_debug_mode(true);
    assert!(pool.get_stats().debug_mode);
}

#[test]
fn test_lifecycle_errors_and_idempotent_stop() {
    let pool = PoolManager::create(test_config("pool-lifecycle", 1, 1)).unwrap();
    assert_eq!(pool.state(), PoolState::Created);
    assert!(matches!(
        pool.submit_async(TaskDesc::new("early"), b""),
        Err(PoolError::InvalidParameter(_))
    ));

    pool.start().unwrap();
    assert!(matches!(pool.start(), Err(PoolError::InvalidParameter(_))));
    let queued = pool.submit_async(sleep_task(), &encode_u64(100)).unwrap();

    pool.stop(Duration::from_secs(2)).unwrap();
    assert_eq!(pool.state(), PoolState::Stopped);
    assert_eq!(queued.wait(Some(Duration::ZERO)).unwrap().state, TaskState::Completed);
    assert_eq!(pool.get_stats().active_workers, 0);

    assert!(matches!(pool.submit_async(TaskDesc::new("late"), b""), Err(PoolError::ShutdownInProgress)));
    assert!(matches!(pool.start(), Err(PoolError::ShutdownInProgress)));
    pool.stop(Duration::from_secs(1)).unwrap();
    pool.destroy();
    pool.destroy();
}

#[test]
fn test_stop_fails_unfinished_tasks() {
    let pool = started_pool(test_config("pool-stop-fail", 1, 1));
    let long = pool.submit_async(sleep_task(), &encode_u64(5_000)).unwrap();
    let queued = pool.submit_async(TaskDesc::new("echo"), b"queued").unwrap();
    assert!(wait_until(Duration::from_secs(2), || long.state() == TaskState::Running));

    pool.stop(Duration::from_millis(100)).unwrap();
    for future in [long, queued] {
        let result = future.wait(Some(Duration::ZERO)).unwrap();
        assert_eq!(result.state, TaskState::Failed);
        assert_eq!(result.error_code(), Some(ErrorCode::ShutdownInProgress));
    }
}

#[test]
fn test_terminate_signal_drains_running_task() {
    let pool = started_pool(test_config("pool-signal-drain", 1, 1));
    let running = pool.submit_async(sleep_task(), &encode_u64(300)).unwrap();
    let queued = pool.submit_async(fib_task(), &encode_u64(20)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || running.state() == TaskState::Running));

    pool.deliver_signal(PoolSignal::Terminate).unwrap();
    assert!(wait_until(Duration::from_secs(1), || pool.state() != PoolState::Running));
    assert!(matches!(
        pool.submit_async(fib_task(), &encode_u64(1)),
        Err(PoolError::ShutdownInProgress)
    ));

    let result = running.wait(Some(RESULT_TIMEOUT)).unwrap();
    assert_eq!(result.state, TaskState::Completed);
    assert_eq!(result.output_bytes(), b"slept");
    let result = queued.wait(Some(RESULT_TIMEOUT)).unwrap();
    assert_eq!(decode_u64(result.output_bytes()), 6765);

    assert!(wait_until(RESULT_TIMEOUT, || pool.state() == PoolState::Stopped));
    assert_eq!(pool.get_stats().active_workers, 0);
    pool.stop(Duration::ZERO).unwrap();
}

#[test]
fn test_interrupt_signal_fails_tasks_past_stop_timeout() {
    let mut config = test_config("pool-signal-timeout", 1, 1);
    config.stop_timeout = Duration::from_millis(200);
    let pool = started_pool(config);
    let long = pool.submit_async(sleep_task(), &encode_u64(10_000)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || long.state() == TaskState::Running));

    pool.deliver_signal(PoolSignal::Interrupt).unwrap();
    let result = long.wait(Some(RESULT_TIMEOUT)).unwrap();
    assert_eq!(result.state, TaskState::Failed);
    assert_eq!(result.error_code(), Some(ErrorCode::ShutdownInProgress));
    assert!(wait_until(RESULT_TIMEOUT, || pool.state() == PoolState::Stopped));
}

#[tokio::test]
async fn test_async_waits() {
    let pool = started_pool(test_config("pool-async", 2, 2));
    let futures: Vec<_> = [3u64, 7, 12]
        .iter()
        .map(|n| pool.submit_async(fib_task(), &encode_u64(*n)).unwrap())
        .collect();

    let first = futures[0].wait_async(Some(RESULT_TIMEOUT)).await.unwrap();
    assert_eq!(decode_u64(first.output_bytes()), 2);

    let values: Vec<u64> = wait_all_async(&futures, Some(RESULT_TIMEOUT))
        .await
        .into_iter()
        .map(|r| decode_u64(r.unwrap().output_bytes()))
        .collect();
    assert_eq!(values, vec![2, 13, 144]);
}
