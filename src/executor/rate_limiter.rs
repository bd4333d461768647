//! Sliding-window rate limiter
//!
//! A 60-second window of execute-commit timestamps. `can_execute` prunes
//! and reports budget without mutating the committed set; `record` is
//! called only after every guard has passed and execution is committed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Window width for the execution budget
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window limiter over execute commits
pub struct RateLimiter {
    limit: usize,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(&self, now: Instant) {
        let mut timestamps = self.timestamps.lock();
        while let Some(oldest) = timestamps.front() {
            if now.duration_since(*oldest) >= RATE_WINDOW {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Budget remaining in the current window
    pub fn remaining_budget_at(&self, now: Instant) -> usize {
        self.prune(now);
        self.limit.saturating_sub(self.timestamps.lock().len())
    }

    /// Whether an execution may be committed right now
    pub fn can_execute_at(&self, now: Instant) -> bool {
        self.remaining_budget_at(now) > 0
    }

    pub fn can_execute(&self) -> bool {
        self.can_execute_at(Instant::now())
    }

    /// Commit one execution timestamp
    pub fn record_at(&self, now: Instant) {
        self.timestamps.lock().push_back(now);
    }

    pub fn record(&self) {
        self.record_at(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhausts_after_limit_records() {
        let limiter = RateLimiter::new(6);
        let now = Instant::now();
        for _ in 0..6 {
            assert!(limiter.can_execute_at(now));
            limiter.record_at(now);
        }
        assert!(!limiter.can_execute_at(now));
        assert_eq!(limiter.remaining_budget_at(now), 0);
    }

    #[test]
    fn budget_returns_after_window_of_inactivity() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();
        limiter.record_at(start);
        limiter.record_at(start);
        assert!(!limiter.can_execute_at(start));

        let later = start + RATE_WINDOW + Duration::from_secs(1);
        assert!(limiter.can_execute_at(later));
        assert_eq!(limiter.remaining_budget_at(later), 2);
    }

    #[test]
    fn can_execute_does_not_consume_budget() {
        let limiter = RateLimiter::new(1);
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.can_execute_at(now));
        }
        assert_eq!(limiter.remaining_budget_at(now), 1);
    }
}
