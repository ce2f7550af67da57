//! Reconnect backoff policy.

use std::time::Duration;

/// Exponential reconnect schedule without jitter: `base * 2^attempt`,
/// capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    /// Reconnects allowed before giving up (0 = never give up).
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Delay before reconnect number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponent = attempt.min(20);
        let delay_ms = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// True once `attempt` reconnects have already been scheduled without success.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
