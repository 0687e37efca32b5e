//! Backoff primitives
//!
//! `SpinBackoff` is the try-lock loop used by trims so they never block
//! foreground operations for longer than one eviction step. `RetryGate`
//! throttles reopening of an index that failed to open.

use std::thread;
use std::time::{Duration, Instant};

/// Sleep between failed lock attempts during trims
pub const DEFAULT_SPIN_SLEEP: Duration = Duration::from_millis(10);

/// Reopen attempts allowed before the gate closes for good
pub const DEFAULT_MAX_FAILURES: u32 = 8;

/// Minimum spacing between reopen attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Retry a non-blocking attempt with a fixed sleep until it succeeds
#[derive(Debug, Clone, Copy)]
pub struct SpinBackoff {
    sleep: Duration,
}

impl SpinBackoff {
    #[must_use]
    pub const fn new(sleep: Duration) -> Self {
        Self { sleep }
    }

    #[must_use]
    pub const fn sleep(&self) -> Duration {
        self.sleep
    }

    /// Call `attempt` until it yields a value, sleeping between failures
    pub fn acquire<T>(&self, mut attempt: impl FnMut() -> Option<T>) -> T {
        loop {
            if let Some(value) = attempt() {
                return value;
            }
            thread::sleep(self.sleep);
        }
    }
}

impl Default for SpinBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_SPIN_SLEEP)
    }
}

/// Failure counter that decides whether a reopen may be attempted
#[derive(Debug, Clone)]
pub struct RetryGate {
    max_failures: u32,
    min_interval: Duration,
    failures: u32,
    last_failure: Option<Instant>,
}

impl RetryGate {
    #[must_use]
    pub const fn new(max_failures: u32, min_interval: Duration) -> Self {
        Self {
            max_failures,
            min_interval,
            failures: 0,
            last_failure: None,
        }
    }

    /// Whether an attempt is allowed now
    #[must_use]
    pub fn allows(&self) -> bool {
        self.allows_at(Instant::now())
    }

    /// Whether an attempt is allowed at `now`
    ///
    /// Both conditions must hold: fewer than `max_failures` recorded
    /// failures, and more than `min_interval` since the last one.
    #[must_use]
    pub fn allows_at(&self, now: Instant) -> bool {
        if self.failures >= self.max_failures {
            return false;
        }
        self.last_failure
            .is_none_or(|at| now.saturating_duration_since(at) > self.min_interval)
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(now);
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.last_failure = None;
    }

    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for RetryGate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILURES, DEFAULT_RETRY_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spin_backoff_retries_until_success() {
        let backoff = SpinBackoff::new(Duration::from_millis(1));
        let mut attempts = 0;
        let value = backoff.acquire(|| {
            attempts += 1;
            (attempts == 3).then_some("locked")
        });
        assert_eq!(value, "locked");
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_retry_gate_interval() {
        let mut gate = RetryGate::new(8, Duration::from_secs(2));
        let start = Instant::now();
        assert!(gate.allows_at(start));

        gate.record_failure_at(start);
        assert!(!gate.allows_at(start + Duration::from_secs(1)));
        assert!(!gate.allows_at(start + Duration::from_secs(2)));
        assert!(gate.allows_at(start + Duration::from_millis(2001)));
    }

    #[test]
    fn test_retry_gate_max_failures() {
        let mut gate = RetryGate::new(3, Duration::from_secs(2));
        let mut now = Instant::now();
        for _ in 0..3 {
            gate.record_failure_at(now);
            now += Duration::from_secs(10);
        }
        assert_eq!(gate.failures(), 3);
        // Interval has long passed but the budget is spent
        assert!(!gate.allows_at(now));

        gate.record_success();
        assert_eq!(gate.failures(), 0);
        assert!(gate.allows_at(now));
    }
}
