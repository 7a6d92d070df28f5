//! Circuit breaker for upstream calls
//!
//! Counts consecutive server failures. After [`FAILURE_THRESHOLD`] failures the
//! circuit opens and calls fail fast until [`RESET_TIMEOUT`] has passed since
//! the last failure, at which point it closes again on its own.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Consecutive failures that open the circuit
pub const FAILURE_THRESHOLD: u32 = 5;

/// How long the circuit stays open after the last failure
pub const RESET_TIMEOUT: Duration = Duration::from_secs(30);

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    failures: u32,
    open: bool,
    last_failure: Option<Instant>,
}

/// Process-wide breaker shared by every call through one retry transport
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed call
    ///
    /// Returns true if this call opened the circuit.
    pub fn record_failure(&self) -> bool {
        self.record_failure_at(Instant::now())
    }

    pub(crate) fn record_failure_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(now);

        if inner.failures >= FAILURE_THRESHOLD && !inner.open {
            inner.open = true;
            return true;
        }
        false
    }

    /// Record a successful call; closes the circuit
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.failures = 0;
        inner.open = false;
    }

    /// Whether calls should fail fast right now
    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    pub(crate) fn is_open_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        if !inner.open {
            return false;
        }

        let cooling = inner
            .last_failure
            .is_some_and(|last| now.saturating_duration_since(last) < RESET_TIMEOUT);
        if cooling {
            return true;
        }

        // Reset window elapsed
        inner.open = false;
        inner.failures = 0;
        false
    }

    pub fn state(&self) -> CircuitState {
        if self.is_open() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Current consecutive failure count
    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new();
        let now = Instant::now();

        for _ in 0..FAILURE_THRESHOLD - 1 {
            assert!(!breaker.record_failure_at(now));
            assert!(!breaker.is_open_at(now));
        }

        // The threshold-th failure trips it, and only that one reports the transition
        assert!(breaker.record_failure_at(now));
        assert!(breaker.is_open_at(now));
        assert!(!breaker.record_failure_at(now));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets() {
        let breaker = CircuitBreaker::new();
        let now = Instant::now();
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure_at(now);
        }
        assert!(breaker.is_open_at(now));

        breaker.record_success();
        assert!(!breaker.is_open_at(now));
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn test_self_heals_after_reset_timeout() {
        let breaker = CircuitBreaker::new();
        let start = Instant::now();
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure_at(start);
        }

        let almost = start + RESET_TIMEOUT - Duration::from_millis(1);
        assert!(breaker.is_open_at(almost));

        let later = start + RESET_TIMEOUT;
        assert!(!breaker.is_open_at(later));
        assert_eq!(breaker.failures(), 0);

        // Counting starts from one again, not from the old total
        assert!(!breaker.record_failure_at(later));
        assert_eq!(breaker.failures(), 1);
        assert!(!breaker.is_open_at(later));
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(CircuitState::Closed.as_str(), "closed");
        assert_eq!(CircuitState::Open.as_str(), "open");
        assert_eq!(CircuitBreaker::new().state(), CircuitState::Closed);
    }
}
