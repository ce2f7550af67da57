//! Ordered dispatch policy.
//!
//! `decide` is the single place that answers "may we call downstream now?".
//! It reads a point-in-time snapshot of the guard state and never touches
//! the network or a timer, so it can be tested with plain `Instant`s.

use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

/// Why a dispatch did not reach downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Downstream service is paused after repeated unavailability.
    Degraded,
    /// Inside a backoff window set by a previous failure.
    Backoff,
    /// Circuit breaker open.
    CircuitOpen,
    /// Nothing to send.
    EmptyBatch,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Degraded => "degraded",
            Self::Backoff => "backoff",
            Self::CircuitOpen => "circuit_open",
            Self::EmptyBatch => "empty_batch",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Skip(SkipReason),
}

/// The three deadlines the policy looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardSnapshot {
    /// Set while the degraded tracker is paused.
    pub paused_until: Option<Instant>,
    pub backoff_until: Option<Instant>,
    pub breaker_open_until: Option<Instant>,
}

/// Apply the policy in order: degraded pause, backoff, breaker.
pub fn decide(snapshot: &GuardSnapshot, now: Instant) -> Decision {
    if matches!(snapshot.paused_until, Some(until) if now < until) {
        return Decision::Skip(SkipReason::Degraded);
    }
    if matches!(snapshot.backoff_until, Some(until) if now < until) {
        return Decision::Skip(SkipReason::Backoff);
    }
    if matches!(snapshot.breaker_open_until, Some(until) if now < until) {
        return Decision::Skip(SkipReason::CircuitOpen);
    }
    Decision::Proceed
}
