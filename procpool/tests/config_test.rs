// Configuration validation as seen through PoolManager::create


use std::time::Duration;

use procpool::{ErrorCode, PoolConfig, PoolError, PoolManager, RestartPolicy, MAX_WORKERS};
use test_helpers::*;

fn rejected(config: PoolConfig) -> String {
    match PoolManager::create(config) {
        Err(PoolError::InvalidParameter(message)) => message,
        Err(other) => panic!("expected InvalidParameter, got {:?}", other),
        Ok(_) => panic!("invalid configuration was accepted"),
    }
}

#[test]
fn test_worker_bounds() {
    assert!(rejected(test_config("cfg", 0, 2)).contains("min_workers"));
    assert!(rejected(test_config("cfg", 3, 2)).contains("max_workers"));
    assert!(rejected(test_config("cfg", 1, MAX_WORKERS + 1)).contains("hard cap"));
    assert!(PoolManager::create(test_config("cfg", 1, MAX_WORKERS)).is_ok());
}

#[test]
fn test_queue_and_channel_geometry() {
    assert!(rejected(test_config("cfg", 1, 1).with_queue_size(100)).contains("queue_size"));
    assert!(rejected(test_config("cfg", 1, 1).with_queue_size(1)).contains("queue_size"));

    let mut config = test_config("cfg", 1, 1);
    config.channel_slots = 6;
    assert!(rejected(config).contains("channel_slots"));

    let mut config = test_config("cfg", 1, 1);
    config.slot_size = 16;
    assert!(rejected(config).contains("slot_size"));
}

#[test]
fn test_timing_and_restart_policy() {
    assert!(rejected(test_config("cfg", 1, 1).with_heartbeat_interval(Duration::ZERO)).contains("heartbeat"));

    let policy = RestartPolicy { max_retries: 3, within: Duration::ZERO };
    assert!(rejected(test_config("cfg", 1, 1).with_restart_policy(policy)).contains("restart_policy"));

    // Zero task timeout only disables expiry
    assert!(PoolManager::create(test_config("cfg", 1, 1).with_task_timeout(Duration::ZERO)).is_ok());
}

#[test]
fn test_pool_name_rules() {
    let config = |name: &str| PoolConfig { pool_name: name.to_string(), ..test_config("cfg", 1, 1) };
    rejected(config(""));
    rejected(config("has space"));
    rejected(config("slash/name"));
    rejected(config(&"x".repeat(256)));
    assert!(PoolManager::create(config("ok_name-1.2")).is_ok());
}

#[test]
fn test_rejection_maps_to_invalid_parameter_code() {
    let err = PoolManager::create(test_config("cfg", 0, 1)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);
}

#[test]
fn test_created_pool_has_no_workers() {
    let pool = PoolManager::create(test_config("cfg", 2, 4)).unwrap();
    let stats = pool.get_stats();
    assert_eq!(stats.active_workers, 0);
    assert_eq!(pool.config().min_workers, 2);
    assert!(pool.get_workers().is_empty());
}
