//! Counter-based circuit breaker for the dispatch path
//!
//! Each trip doubles the open interval from a 5 s base, capped at 60 s.
//! At `resume_at` the breaker is half-open and allows a single probe; one
//! recorded success re-permits execution immediately, and three consecutive
//! successes reset the trip count.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

const BASE_OPEN: Duration = Duration::from_secs(5);
const MAX_OPEN: Duration = Duration::from_secs(60);
const SUCCESSES_TO_RESET: u32 = 3;

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Default)]
struct BreakerInner {
    count: u32,
    tripped: bool,
    resume_at: Option<Instant>,
    consecutive_successes: u32,
}

/// Circuit breaker guarding the egress path
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    /// Record an infrastructure failure and open the breaker
    pub fn trip_at(&self, now: Instant, error: &str) {
        let mut inner = self.inner.lock();
        inner.count += 1;
        inner.tripped = true;
        inner.consecutive_successes = 0;
        let open_for = BASE_OPEN
            .checked_mul(2u32.saturating_pow(inner.count.saturating_sub(1)))
            .unwrap_or(MAX_OPEN)
            .min(MAX_OPEN);
        inner.resume_at = Some(now + open_for);
        warn!(
            count = inner.count,
            open_ms = open_for.as_millis() as u64,
            error,
            "circuit breaker tripped"
        );
    }

    pub fn trip(&self, error: &str) {
        self.trip_at(Instant::now(), error);
    }

    /// Open means tripped and still before `resume_at`; at or past
    /// `resume_at` the breaker is half-open and allows one probe
    pub fn is_open_at(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        inner.tripped && inner.resume_at.is_some_and(|resume_at| now < resume_at)
    }

    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> BreakerState {
        let inner = self.inner.lock();
        if !inner.tripped {
            return BreakerState::Closed;
        }
        match inner.resume_at {
            Some(resume_at) if now < resume_at => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state_at(Instant::now())
    }

    /// A success re-permits execution immediately; three in a row reset
    /// the trip count
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.tripped = false;
        inner.resume_at = None;
        inner.consecutive_successes += 1;
        if inner.consecutive_successes >= SUCCESSES_TO_RESET {
            inner.count = 0;
            inner.consecutive_successes = 0;
        }
    }

    pub fn trip_count(&self) -> u32 {
        self.inner.lock().count
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trip_opens_until_resume_at() {
        let breaker = CircuitBreaker::new();
        let now = Instant::now();
        assert_eq!(breaker.state_at(now), BreakerState::Closed);

        breaker.trip_at(now, "connect refused");
        assert!(breaker.is_open_at(now));
        assert!(breaker.is_open_at(now + Duration::from_secs(4)));
        // At resume_at the breaker is half-open: one probe allowed
        assert!(!breaker.is_open_at(now + Duration::from_secs(5)));
        assert_eq!(
            breaker.state_at(now + Duration::from_secs(5)),
            BreakerState::HalfOpen
        );
    }

    #[test]
    fn open_interval_doubles_and_caps() {
        let breaker = CircuitBreaker::new();
        let now = Instant::now();
        breaker.trip_at(now, "1");
        breaker.trip_at(now, "2");
        // count = 2 -> 10s open
        assert!(breaker.is_open_at(now + Duration::from_secs(9)));
        assert!(!breaker.is_open_at(now + Duration::from_secs(10)));

        for n in 0..10 {
            breaker.trip_at(now, &format!("{}", n));
        }
        // capped at 60s
        assert!(breaker.is_open_at(now + Duration::from_secs(59)));
        assert!(!breaker.is_open_at(now + Duration::from_secs(60)));
    }

    #[test]
    fn single_success_repermits_immediately() {
        let breaker = CircuitBreaker::new();
        let now = Instant::now();
        breaker.trip_at(now, "boom");
        assert!(breaker.is_open_at(now));

        breaker.record_success();
        assert!(!breaker.is_open_at(now));
        assert_eq!(breaker.state_at(now), BreakerState::Closed);
        // Count survives a single success
        assert_eq!(breaker.trip_count(), 1);
    }

    #[test]
    fn three_consecutive_successes_reset_count() {
        let breaker = CircuitBreaker::new();
        let now = Instant::now();
        breaker.trip_at(now, "a");
        breaker.trip_at(now, "b");

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.trip_count(), 2);
        breaker.record_success();
        assert_eq!(breaker.trip_count(), 0);
    }

    #[test]
    fn failure_resets_the_success_streak() {
        let breaker = CircuitBreaker::new();
        let now = Instant::now();
        breaker.trip_at(now, "a");
        breaker.record_success();
        breaker.record_success();
        breaker.trip_at(now, "b");
        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.trip_count(), 2);
    }
}
