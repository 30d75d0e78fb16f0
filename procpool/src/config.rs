use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use procpool_api::{PoolError, Result, DEFAULT_QUEUE_SIZE, MAX_TASK_DATA_SIZE, MAX_WORKERS};

use crate::handler::{echo_handler, HandlerRegistry, TaskHandler, UserContext};

/// Interval between worker heartbeats; a worker is dead after two missed beats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Number of slots in each direction of a worker's shared channel.
pub const DEFAULT_CHANNEL_SLOTS: usize = 8;

/// Room reserved in every slot for the frame header and error message.
pub const FRAME_RESERVE: usize = 1024;

/// Slot size large enough for a maximum-size task payload.
pub const DEFAULT_SLOT_SIZE: usize = MAX_TASK_DATA_SIZE + FRAME_RESERVE;

/// Upper bound on a single shared-channel slot.
pub const MAX_SLOT_SIZE: usize = 16 * 1024 * 1024;

/// Fixed period of the event loop's maintenance tick.
pub const TIMER_INTERVAL: Duration = Duration::from_secs(1);

// Shared memory object names are limited to NAME_MAX including the worker suffix
const MAX_POOL_NAME_LEN: usize = 200;

// --- Configuration Enums ---

/// Isolation used for worker execution contexts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// Each worker is a forked OS process talking over named shared memory.
    Process,
    /// Each worker is an OS thread of the master talking over an anonymous mapping.
    Thread,
}

/// How dead workers are restarted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed per worker slot inside the `within` window.
    pub max_retries: usize,
    pub within: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self { max_retries: 3, within: Duration::from_secs(60) }
    }
}

/// Settings that can be changed on a running pool through a reload command.
///
/// `None` leaves the current value untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeTuning {
    pub task_timeout: Option<Duration>,
    pub worker_idle_timeout: Option<Duration>,
    pub enable_auto_scaling: Option<bool>,
    pub enable_metrics: Option<bool>,
}

// --- Pool Configuration ---

/// Configuration for a [`PoolManager`](crate::pool::PoolManager).
#[derive(Clone)]
pub struct PoolConfig {
    /// Workers kept alive at all times once the pool is running.
    pub min_workers: usize,

    /// Upper bound for resize and auto-scaling; at most [`MAX_WORKERS`].
    pub max_workers: usize,

    /// Capacity of the pending-task queue; must be a power of two.
    /// One slot is reserved, so `queue_size - 1` tasks can wait at once.
    pub queue_size: usize,

    /// Idle time after which auto-scaling may retire a worker above `min_workers`.
    pub worker_idle_timeout: Duration,

    /// Running tasks older than this are marked timed out. Zero disables expiry.
    pub task_timeout: Duration,

    pub enable_auto_scaling: bool,

    /// Record latency trackers and histograms. Counters are always kept.
    pub enable_metrics: bool,

    /// Used in logs, thread names and shared memory names.
    pub pool_name: String,

    /// Handler for tasks that do not name one.
    pub default_handler: TaskHandler,

    /// Named handlers tasks can select through `TaskDesc::handler`.
    pub handlers: HashMap<String, TaskHandler>,

    /// Value made available to handlers through `HandlerContext::user_context`.
    pub user_context: Option<UserContext>,

    pub heartbeat_interval: Duration,

    /// Slots per direction in each worker's shared channel; a power of two.
    pub channel_slots: usize,

    /// Bytes per shared-channel slot, including the 4-byte length prefix.
    pub slot_size: usize,

    pub restart_policy: RestartPolicy,

    /// Grace period for a worker to exit before it is killed.
    pub stop_timeout: Duration,

    pub transport: TransportKind,

    /// Route SIGTERM, SIGINT, SIGCHLD, SIGUSR1 and SIGUSR2 to the event loop.
    /// Handlers stay installed for the life of the process once enabled.
    pub handle_signals: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            min_workers: 2,
            max_workers: num_cpus::get().clamp(2, MAX_WORKERS),
            queue_size: DEFAULT_QUEUE_SIZE,
            worker_idle_timeout: Duration::from_secs(300),
            task_timeout: Duration::from_secs(30),
            enable_auto_scaling: true,
            enable_metrics: true,
            pool_name: format!("pool-{}", &id[..8]),
            default_handler: echo_handler(),
            handlers: HashMap::new(),
            user_context: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            channel_slots: DEFAULT_CHANNEL_SLOTS,
            slot_size: DEFAULT_SLOT_SIZE,
            restart_policy: RestartPolicy::default(),
            stop_timeout: Duration::from_secs(5),
            transport: TransportKind::Process,
            handle_signals: false,
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<&String> = self.handlers.keys().collect();
        handlers.sort_unstable();
        f.debug_struct("PoolConfig")
            .field("pool_name", &self.pool_name)
            .field("min_workers", &self.min_workers)
            .field("max_workers", &self.max_workers)
            .field("queue_size", &self.queue_size)
            .field("worker_idle_timeout", &self.worker_idle_timeout)
            .field("task_timeout", &self.task_timeout)
            .field("enable_auto_scaling", &self.enable_auto_scaling)
            .field("enable_metrics", &self.enable_metrics)
            .field("handlers", &handlers)
            .field("has_user_context", &self.user_context.is_some())
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("channel_slots", &self.channel_slots)
            .field("slot_size", &self.slot_size)
            .field("restart_policy", &self.restart_policy)
            .field("stop_timeout", &self.stop_timeout)
            .field("transport", &self.transport)
            .field("handle_signals", &self.handle_signals)
            .finish()
    }
}

impl PoolConfig {
    pub fn new(pool_name: impl Into<String>) -> Self {
        Self { pool_name: pool_name.into(), ..Default::default() }
    }

    pub fn with_workers(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_default_handler(mut self, handler: TaskHandler) -> Self {
        self.default_handler = handler;
        self
    }

    /// Registers a named handler.
    pub fn with_handler(mut self, name: impl Into<String>, handler: TaskHandler) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn with_user_context(mut self, context: UserContext) -> Self {
        self.user_context = Some(context);
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_auto_scaling(mut self, enabled: bool) -> Self {
        self.enable_auto_scaling = enabled;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.worker_idle_timeout = timeout;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Checks every invariant the pool relies on.
    pub fn validate(&self) -> Result<()> {
        if self.min_workers == 0 {
            return Err(invalid("min_workers must be greater than 0"));
        }
        if self.max_workers < self.min_workers {
            return Err(invalid(format!(
                "max_workers ({}) must be >= min_workers ({})",
                self.max_workers, self.min_workers
            )));
        }
        if self.max_workers > MAX_WORKERS {
            return Err(invalid(format!(
                "max_workers ({}) exceeds the hard cap of {}",
                self.max_workers, MAX_WORKERS
            )));
        }
        if self.queue_size < 2 || !self.queue_size.is_power_of_two() {
            return Err(invalid(format!("queue_size ({}) must be a power of two >= 2", self.queue_size)));
        }
        if self.channel_slots < 2 || !self.channel_slots.is_power_of_two() {
            return Err(invalid(format!(
                "channel_slots ({}) must be a power of two >= 2",
                self.channel_slots
            )));
        }
        if self.slot_size <= FRAME_RESERVE || self.slot_size > MAX_SLOT_SIZE {
            return Err(invalid(format!(
                "slot_size ({}) must be in ({}, {}]",
                self.slot_size, FRAME_RESERVE, MAX_SLOT_SIZE
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat_interval must be non-zero"));
        }
        if self.restart_policy.within.is_zero() {
            return Err(invalid("restart_policy.within must be non-zero"));
        }
        validate_pool_name(&self.pool_name)?;
        for name in self.handlers.keys() {
            if name.is_empty() || name.len() > u16::MAX as usize {
                return Err(invalid(format!("handler name {:?} has an invalid length", name)));
            }
        }
        Ok(())
    }

    /// Registry built from the default and named handlers.
    pub fn handler_registry(&self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new(self.default_handler.clone());
        for (name, handler) in &self.handlers {
            registry.register(name.clone(), handler.clone());
        }
        registry
    }

    /// Largest task input that fits a slot for the given handler name length.
    pub fn max_input_size(&self, handler_name_len: usize) -> usize {
        let slot_payload = self.slot_size.saturating_sub(FRAME_RESERVE + handler_name_len);
        slot_payload.min(MAX_TASK_DATA_SIZE)
    }
}

fn validate_pool_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_POOL_NAME_LEN {
        return Err(invalid(format!(
            "pool_name must be 1 to {} bytes long",
            MAX_POOL_NAME_LEN
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return Err(invalid(format!(
            "pool_name {:?} may only contain ASCII letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> PoolError {
    PoolError::InvalidParameter(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.pool_name.starts_with("pool-"));
        assert_ne!(config.pool_name, PoolConfig::default().pool_name);
    }

    #[test]
    fn test_max_input_size_respects_slot() {
        let config = PoolConfig { slot_size: 4096, ..Default::default() };
        assert_eq!(config.max_input_size(0), 4096 - FRAME_RESERVE);
        assert_eq!(config.max_input_size(10), 4096 - FRAME_RESERVE - 10);
        assert_eq!(PoolConfig::default().max_input_size(0), MAX_TASK_DATA_SIZE);
    }

    #[test]
    fn test_registry_includes_named_handlers() {
        let config = PoolConfig::default().with_handler("double", echo_handler());
        let registry = config.handler_registry();
        assert!(registry.contains(None));
        assert!(registry.contains(Some("double")));
        assert!(!registry.contains(Some("triple")));
    }
}
