//! Monotonic clock shared by the master and its worker processes.
//!
//! `CLOCK_MONOTONIC` is system-wide, so a timestamp written into shared memory
//! by a worker can be compared with one read by the master.

use std::time::Duration;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Current monotonic time in nanoseconds.
pub fn now_ns() -> u64 {
    let ts = monotonic_timespec();
    (ts.tv_sec as u64) * NANOS_PER_SEC + ts.tv_nsec as u64
}

/// Absolute `CLOCK_MONOTONIC` deadline `timeout` from now, as expected by
/// `pthread_cond_timedwait` on a condition variable bound to that clock.
pub fn deadline_after(timeout: Duration) -> libc::timespec {
    let now = monotonic_timespec();
    let mut sec = (now.tv_sec as u64).saturating_add(timeout.as_secs());
    let mut nsec = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    if nsec >= NANOS_PER_SEC {
        sec = sec.saturating_add(1);
        nsec -= NANOS_PER_SEC;
    }
    libc::timespec {
        tv_sec: sec.min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: nsec as _,
    }
}

/// Elapsed time since an earlier `now_ns()` reading.
pub fn elapsed_since(start_ns: u64) -> Duration {
    Duration::from_nanos(now_ns().saturating_sub(start_ns))
}

fn monotonic_timespec() -> libc::timespec {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // CLOCK_MONOTONIC cannot fail with a valid pointer
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn test_deadline_normalises_nanos() {
        let deadline = deadline_after(Duration::from_millis(1_999));
        assert!(deadline.tv_nsec >= 0);
        assert!((deadline.tv_nsec as u64) < NANOS_PER_SEC);
        let deadline_ns = deadline.tv_sec as u64 * NANOS_PER_SEC + deadline.tv_nsec as u64;
        assert!(deadline_ns >= now_ns() + 1_900_000_000);
    }
}
