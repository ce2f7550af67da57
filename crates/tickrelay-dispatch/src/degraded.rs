//! Long-horizon degraded-service tracker.
//!
//! Counts downstream unavailability separately from the circuit breaker.
//! Once the count reaches `max_database_retries` the guard pauses for a long
//! window (minutes) and only a manual override or the window elapsing
//! resumes dispatching.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedServiceState {
    pub connection_attempts: u32,
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: String,
}

impl DegradedServiceState {
    /// Count one failed attempt. Returns the new count.
    pub fn record_attempt(&mut self, error: impl Into<String>) -> u32 {
        self.connection_attempts = self.connection_attempts.saturating_add(1);
        self.last_error = error.into();
        self.connection_attempts
    }

    pub fn pause(&mut self, resume_at: DateTime<Utc>) {
        self.paused = true;
        self.resume_at = Some(resume_at);
    }

    /// Clear the pause but keep the attempt count.
    pub fn resume(&mut self) {
        self.paused = false;
        self.resume_at = None;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether a pause is in effect at `now` (wall clock).
    #[must_use]
    pub fn is_paused_at(&self, now: DateTime<Utc>) -> bool {
        self.paused && self.resume_at.map_or(true, |at| now < at)
    }
}
