//! Running batch statistics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Counters for one lane. Updated by the batcher only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    /// Updates accepted by `enqueue`.
    pub total_received: u64,
    /// Updates that overwrote an unflushed value for the same symbol.
    pub total_coalesced: u64,
    pub total_batches_flushed: u64,
    /// Updates handed to the flush sink.
    pub total_flushed: u64,
    pub average_batch_size: f64,
    pub last_batch_size: usize,
    pub last_flush_duration_ms: f64,
    pub max_observed_batch_size: usize,
    /// Updates deferred because a flush hit `max_batch_size`.
    pub total_requeued: u64,
    pub flush_errors: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
}

impl BatchStats {
    pub(crate) fn record_received(&mut self, coalesced: bool) {
        self.total_received += 1;
        if coalesced {
            self.total_coalesced += 1;
        }
    }

    pub(crate) fn record_flush(&mut self, size: usize, duration: Duration, requeued: usize, failed: bool) {
        self.total_batches_flushed += 1;
        self.total_flushed += size as u64;
        self.average_batch_size = self.total_flushed as f64 / self.total_batches_flushed as f64;
        self.last_batch_size = size;
        self.last_flush_duration_ms = duration.as_secs_f64() * 1000.0;
        self.max_observed_batch_size = self.max_observed_batch_size.max(size);
        self.total_requeued += requeued as u64;
        if failed {
            self.flush_errors += 1;
        }
        self.last_flush_at = Some(Utc::now());
    }
}
