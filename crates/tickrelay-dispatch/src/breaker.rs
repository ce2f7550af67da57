//! Consecutive-failure circuit breaker and backoff window.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

// ============================================================================
// CircuitBreaker
// ============================================================================

/// Opens after `threshold` consecutive failures and stays open for
/// `cooldown`. Any success closes it and zeroes the counter.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            open_until: None,
            threshold: threshold.max(1),
            cooldown,
        }
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    #[must_use]
    pub fn open_until(&self) -> Option<Instant> {
        self.open_until
    }

    #[must_use]
    pub fn is_open(&self, now: Instant) -> bool {
        matches!(self.open_until, Some(until) if now < until)
    }

    /// Count a failure. Returns true when this failure opened the breaker.
    ///
    /// Failures while already open extend nothing; the cooldown runs from
    /// the opening failure.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.threshold && !self.is_open(now) {
            self.open_until = Some(now + self.cooldown);
            warn!(
                failures = self.consecutive_failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "Circuit breaker opened"
            );
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        if self.open_until.is_some() || self.consecutive_failures > 0 {
            info!(
                previous_failures = self.consecutive_failures,
                "Circuit breaker closed"
            );
        }
        self.reset();
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }
}

// ============================================================================
// BackoffWindow
// ============================================================================

/// Cooldown during which dispatches are deferred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffWindow {
    active_until: Option<Instant>,
}

impl BackoffWindow {
    pub fn set(&mut self, now: Instant, duration: Duration) {
        self.active_until = Some(now + duration);
    }

    pub fn clear(&mut self) {
        self.active_until = None;
    }

    #[must_use]
    pub fn active_until(&self) -> Option<Instant> {
        self.active_until
    }

    #[must_use]
    pub fn is_active(&self, now: Instant) -> bool {
        matches!(self.active_until, Some(until) if now < until)
    }

    /// Time left in the window, zero once elapsed.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        self.active_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_at_threshold() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(5, Duration::from_secs(60));

        for _ in 0..4 {
            assert!(!breaker.record_failure(now));
        }
        assert!(!breaker.is_open(now));

        assert!(breaker.record_failure(now));
        assert!(breaker.is_open(now));
        assert!(breaker.is_open(now + Duration::from_secs(59)));
        assert!(!breaker.is_open(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_failure_while_open_does_not_reopen() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure(now);
        assert!(breaker.record_failure(now));

        let later = now + Duration::from_secs(30);
        assert!(!breaker.record_failure(later));
        assert_eq!(breaker.open_until(), Some(now + Duration::from_secs(60)));
        assert_eq!(breaker.consecutive_failures(), 3);
    }

    #[test]
    fn test_failures_after_cooldown_reopen() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(10));
        breaker.record_failure(now);
        breaker.record_failure(now);

        let after = now + Duration::from_secs(11);
        assert!(!breaker.is_open(after));
        // Still above threshold: the next failure reopens immediately.
        assert!(breaker.record_failure(after));
    }

    #[test]
    fn test_success_resets() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure(now);
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(!breaker.is_open(now));
    }

    #[test]
    fn test_backoff_window() {
        let now = Instant::now();
        let mut window = BackoffWindow::default();
        assert!(!window.is_active(now));
        assert_eq!(window.remaining(now), Duration::ZERO);

        window.set(now, Duration::from_millis(3000));
        assert!(window.is_active(now + Duration::from_millis(2999)));
        assert!(!window.is_active(now + Duration::from_millis(3000)));
        assert_eq!(
            window.remaining(now + Duration::from_millis(1000)),
            Duration::from_millis(2000)
        );

        window.clear();
        assert!(window.active_until().is_none());
    }
}
