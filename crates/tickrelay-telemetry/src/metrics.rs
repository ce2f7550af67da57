//! Prometheus metrics for the tickrelay pipeline.
//!
//! Covers:
//! - Feed connection state and reconnects
//! - Dropped frames and price update throughput
//! - Per-lane batching
//! - Downstream dispatch outcomes, breaker and pause state
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means duplicate metric names, a startup bug that should crash immediately.
//! These panics only occur during static initialization, never at runtime.

use crate::error::TelemetryResult;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram, register_histogram_vec,
    register_int_counter, register_int_gauge, register_int_gauge_vec, CounterVec, Encoder,
    GaugeVec, Histogram, HistogramVec, IntCounter, IntGauge, IntGaugeVec, TextEncoder,
};

/// Feed connector state (1 = active state, 0 = inactive).
/// Labels: state
pub static FEED_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "tickrelay_feed_state",
        "Feed connector state machine current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

/// Total feed reconnect attempts.
pub static FEED_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickrelay_feed_reconnect_total",
        "Total feed reconnection attempts",
        &["reason"]
    )
    .unwrap()
});

/// Frames dropped by the parser.
pub static FEED_FRAMES_DROPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickrelay_feed_frames_dropped_total",
        "Inbound feed frames dropped without affecting connection state",
        &["reason"]
    )
    .unwrap()
});

/// Price updates parsed from the feed.
pub static PRICE_UPDATES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tickrelay_price_updates_total",
        "Total price updates parsed from the feed"
    )
    .unwrap()
});

/// Subscribe/unsubscribe messages sent.
pub static SUBSCRIPTION_MESSAGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickrelay_subscription_messages_total",
        "Subscription messages sent to the feed",
        &["method"]
    )
    .unwrap()
});

/// Batches flushed per lane.
pub static BATCH_FLUSHED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickrelay_batch_flushed_total",
        "Total batches flushed",
        &["lane"]
    )
    .unwrap()
});

/// Batch size distribution per lane.
pub static BATCH_SIZE: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tickrelay_batch_size",
        "Number of updates per flushed batch",
        &["lane"],
        vec![1.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0]
    )
    .unwrap()
});

/// Updates put back after a capacity-exceeded flush.
pub static BATCH_REQUEUED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickrelay_batch_requeued_total",
        "Updates deferred to the next flush because the batch was full",
        &["lane"]
    )
    .unwrap()
});

/// Flush sink failures per lane.
pub static BATCH_FLUSH_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickrelay_batch_flush_errors_total",
        "Flush callbacks that returned an error",
        &["lane"]
    )
    .unwrap()
});

/// Pending symbols per lane.
pub static BATCH_PENDING: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "tickrelay_batch_pending",
        "Distinct symbols waiting for the next flush",
        &["lane"]
    )
    .unwrap()
});

/// Dispatch outcomes.
/// Labels: outcome (delivered/degraded/skipped_*/throttled/unavailable/hard_failure/transport)
pub static DISPATCH_OUTCOME_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickrelay_dispatch_outcome_total",
        "Dispatch attempts by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Downstream request latency in milliseconds.
pub static DOWNSTREAM_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "tickrelay_downstream_latency_ms",
        "Downstream persistence request latency in milliseconds",
        vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]
    )
    .unwrap()
});

/// Dispatch circuit breaker state (1 = open).
pub static DISPATCH_CIRCUIT_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "tickrelay_dispatch_circuit_open",
        "Dispatch circuit breaker state (1=open)"
    )
    .unwrap()
});

/// Degraded-service pause state (1 = paused).
pub static DISPATCH_PAUSED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "tickrelay_dispatch_paused",
        "Dispatch paused because the downstream service is degraded (1=paused)"
    )
    .unwrap()
});

const FEED_STATES: &[&str] = &[
    "disconnected",
    "connecting",
    "subscribing",
    "connected",
    "reconnecting",
    "failed",
];

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Set the feed state machine state.
    /// Only the active state is set to 1, all others to 0.
    pub fn feed_state_set(state: &str) {
        for s in FEED_STATES {
            FEED_STATE.with_label_values(&[s]).set(0.0);
        }
        FEED_STATE.with_label_values(&[state]).set(1.0);
    }

    /// Record a feed reconnect.
    pub fn feed_reconnect(reason: &str) {
        FEED_RECONNECT_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Record a dropped inbound frame.
    pub fn frame_dropped(reason: &str) {
        FEED_FRAMES_DROPPED_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Record parsed price updates.
    pub fn price_updates(count: usize) {
        PRICE_UPDATES_TOTAL.inc_by(count as u64);
    }

    /// Record a subscription message sent.
    pub fn subscription_message(method: &str) {
        SUBSCRIPTION_MESSAGES_TOTAL.with_label_values(&[method]).inc();
    }

    /// Record a flushed batch.
    pub fn batch_flushed(lane: &str, size: usize) {
        BATCH_FLUSHED_TOTAL.with_label_values(&[lane]).inc();
        BATCH_SIZE.with_label_values(&[lane]).observe(size as f64);
    }

    /// Record updates deferred to the next flush.
    pub fn batch_requeued(lane: &str, count: usize) {
        BATCH_REQUEUED_TOTAL
            .with_label_values(&[lane])
            .inc_by(count as f64);
    }

    /// Record a failed flush callback.
    pub fn batch_flush_error(lane: &str) {
        BATCH_FLUSH_ERRORS_TOTAL.with_label_values(&[lane]).inc();
    }

    /// Update pending symbol count.
    pub fn batch_pending(lane: &str, count: usize) {
        BATCH_PENDING
            .with_label_values(&[lane])
            .set(count as i64);
    }

    /// Record a dispatch outcome.
    pub fn dispatch_outcome(outcome: &str) {
        DISPATCH_OUTCOME_TOTAL.with_label_values(&[outcome]).inc();
    }

    /// Record downstream latency.
    pub fn downstream_latency(latency_ms: f64) {
        DOWNSTREAM_LATENCY_MS.observe(latency_ms);
    }

    /// Set circuit breaker state.
    pub fn circuit_open(is_open: bool) {
        DISPATCH_CIRCUIT_OPEN.set(if is_open { 1 } else { 0 });
    }

    /// Set degraded pause state.
    pub fn paused(is_paused: bool) {
        DISPATCH_PAUSED.set(if is_paused { 1 } else { 0 });
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_state_only_one_active() {
        Metrics::feed_state_set("connected");
        assert_eq!(FEED_STATE.with_label_values(&["connected"]).get(), 1.0);
        assert_eq!(FEED_STATE.with_label_values(&["reconnecting"]).get(), 0.0);

        Metrics::feed_state_set("reconnecting");
        assert_eq!(FEED_STATE.with_label_values(&["connected"]).get(), 0.0);
        assert_eq!(FEED_STATE.with_label_values(&["reconnecting"]).get(), 1.0);
    }

    #[test]
    fn test_render_contains_registered_metrics() {
        Metrics::batch_flushed("primary", 12);
        Metrics::circuit_open(true);
        Metrics::circuit_open(false);

        let text = Metrics::render().unwrap();
        assert!(text.contains("tickrelay_batch_flushed_total"));
        assert!(text.contains("tickrelay_dispatch_circuit_open"));
    }
}
