//! Task handlers and the registry workers resolve them from.
//!
//! Handlers are registered on the [`PoolConfig`](crate::config::PoolConfig)
//! before the pool starts. Process workers are forked from the master, so each
//! worker owns a copy of the registry and tasks refer to handlers by name.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use procpool_api::{TaskId, WorkerId};

/// Function executed by a worker for each task: input bytes in, output bytes out.
///
/// Returning an error fails the task. Wrap a
/// [`TaskFailure`](procpool_api::TaskFailure) in the error to choose the
/// result code; any other error is reported as `HandlerFailed`.
pub type TaskHandler = Arc<dyn Fn(&[u8], &HandlerContext<'_>) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// Caller-supplied value made available to every handler invocation.
pub type UserContext = Arc<dyn Any + Send + Sync>;

/// Wraps a closure as a [`TaskHandler`].
pub fn handler_fn<F>(f: F) -> TaskHandler
where
    F: Fn(&[u8], &HandlerContext<'_>) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handler used when none is configured: returns its input unchanged.
pub fn echo_handler() -> TaskHandler {
    handler_fn(|input, _| Ok(input.to_vec()))
}

/// Per-invocation information handed to a handler.
pub struct HandlerContext<'a> {
    worker_id: WorkerId,
    task_id: TaskId,
    user_context: Option<&'a UserContext>,
    cancel_hint: &'a AtomicU64,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        worker_id: WorkerId,
        task_id: TaskId,
        user_context: Option<&'a UserContext>,
        cancel_hint: &'a AtomicU64,
    ) -> Self {
        Self { worker_id, task_id, user_context, cancel_hint }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// The pool's user context, if it is of type `T`.
    pub fn user_context<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.user_context.and_then(|ctx| ctx.downcast_ref::<T>())
    }

    /// Whether the master asked for this task to be cancelled.
    ///
    /// Long-running handlers should poll this and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_hint.load(Ordering::Acquire) == self.task_id
    }
}

/// Default handler plus named handlers.
#[derive(Clone)]
pub struct HandlerRegistry {
    default: TaskHandler,
    named: HashMap<String, TaskHandler>,
}

impl HandlerRegistry {
    pub fn new(default: TaskHandler) -> Self {
        Self { default, named: HashMap::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, handler: TaskHandler) {
        self.named.insert(name.into(), handler);
    }

    /// `None` selects the default handler.
    pub fn resolve(&self, name: Option<&str>) -> Option<&TaskHandler> {
        match name {
            None => Some(&self.default),
            Some(name) => self.named.get(name),
        }
    }

    pub fn contains(&self, name: Option<&str>) -> bool {
        self.resolve(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.named.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(echo_handler())
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry").field("named", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_is_default() {
        let registry = HandlerRegistry::default();
        let hint = AtomicU64::new(0);
        let ctx = HandlerContext::new(0, 1, None, &hint);
        let handler = registry.resolve(None).unwrap();
        assert_eq!(handler(b"ping", &ctx).unwrap(), b"ping".to_vec());
        assert!(registry.resolve(Some("missing")).is_none());
    }

    #[test]
    fn test_named_handler_and_context() {
        let mut registry = HandlerRegistry::default();
        registry.register(
            "scale",
            handler_fn(|input, ctx| {
                let factor = ctx.user_context::<u8>().copied().unwrap_or(1);
                Ok(input.iter().map(|b| b * factor).collect())
            }),
        );
        let user: UserContext = Arc::new(3u8);
        let hint = AtomicU64::new(0);
        let ctx = HandlerContext::new(2, 9, Some(&user), &hint);

        let handler = registry.resolve(Some("scale")).unwrap();
        assert_eq!(handler(&[1, 2], &ctx).unwrap(), vec![3, 6]);
        assert_eq!(registry.names(), vec!["scale"]);
        assert_eq!(ctx.worker_id(), 2);
        assert!(!ctx.is_cancelled());

        hint.store(9, Ordering::Release);
        assert!(ctx.is_cancelled());
    }
}
