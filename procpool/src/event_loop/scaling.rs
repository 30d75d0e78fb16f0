//! Auto-scaling policy.
//!
//! Pure decision logic; the event loop gathers the inputs on every tick and
//! applies the decision under the topology lock.

use std::time::Duration;

use procpool_api::WorkerId;

/// Inputs of one scaling decision.
#[derive(Debug, Clone, Default)]
pub struct ScaleInput {
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Live workers in the pool.
    pub live: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub idle_timeout: Duration,
    /// Idle workers with how long each has been idle.
    pub idle: Vec<(WorkerId, Duration)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Add one worker.
    Grow,
    /// Retire the given idle worker.
    Shrink(WorkerId),
    Hold,
}

/// Grows by one while queued work outnumbers idle workers and the pool is
/// below its maximum. Otherwise, with nothing queued, retires the
/// highest-indexed worker that has been idle for at least `idle_timeout`
/// while the pool is above its minimum.
pub fn decide(input: &ScaleInput) -> ScaleDecision {
    if input.queued > input.idle.len() && input.live < input.max_workers {
        return ScaleDecision::Grow;
    }

    if input.queued == 0 && input.live > input.min_workers && !input.idle_timeout.is_zero() {
        let candidate = input
            .idle
            .iter()
            .filter(|(_, idle_for)| *idle_for >= input.idle_timeout)
            .map(|(id, _)| *id)
            .max();
        if let Some(id) = candidate {
            return ScaleDecision::Shrink(id);
        }
    }

    ScaleDecision::Hold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(queued: usize, live: usize, idle: Vec<(WorkerId, Duration)>) -> ScaleInput {
        ScaleInput {
            queued,
            live,
            min_workers: 2,
            max_workers: 4,
            idle_timeout: Duration::from_secs(10),
            idle,
        }
    }

    #[test]
    fn test_grows_when_backlog_exceeds_idle_workers() {
        assert_eq!(decide(&input(3, 2, vec![(1, Duration::ZERO)])), ScaleDecision::Grow);
        assert_eq!(decide(&input(1, 2, vec![(1, Duration::ZERO)])), ScaleDecision::Hold);
        assert_eq!(decide(&input(10, 4, vec![])), ScaleDecision::Hold);
    }

    #[test]
    fn test_shrinks_highest_expired_worker() {
        let long = Duration::from_secs(11);
        let short = Duration::from_secs(1);
        let idle = vec![(0, long), (2, long), (3, short)];
        assert_eq!(decide(&input(0, 4, idle.clone())), ScaleDecision::Shrink(2));
        assert_eq!(decide(&input(0, 2, idle.clone())), ScaleDecision::Hold);
        assert_eq!(decide(&input(0, 3, vec![(3, short)])), ScaleDecision::Hold);

        let mut disabled = input(0, 4, idle);
        disabled.idle_timeout = Duration::ZERO;
        assert_eq!(decide(&disabled), ScaleDecision::Hold);
    }
}
