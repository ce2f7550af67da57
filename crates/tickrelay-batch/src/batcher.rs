//! Latest-value-wins update batcher.
//!
//! Each `enqueue` overwrites any unflushed value for the same symbol, so a
//! flush carries only the freshest price per symbol seen in the window.
//! Flushes run on a fixed cadence measured from the previous flush and are
//! bounded by `max_batch_size`; the overflow stays pending for the next cycle.

use crate::error::{BatchError, BatchResult};
use crate::lanes::Lane;
use crate::sink::FlushSink;
use crate::stats::BatchStats;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tickrelay_core::{PriceUpdate, Symbol};
use tickrelay_telemetry::Metrics;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// BatcherConfig
// ============================================================================

/// Configuration for one lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatcherConfig {
    /// Time between flushes in milliseconds.
    pub interval_ms: u64,
    /// Maximum distinct symbols per flushed batch.
    pub max_batch_size: usize,
}

impl BatcherConfig {
    /// Latency-sensitive lane defaults.
    pub fn primary() -> Self {
        Self {
            interval_ms: 2_000,
            max_batch_size: 50,
        }
    }

    /// Bulk lane defaults: longer interval, larger batches.
    pub fn secondary() -> Self {
        Self {
            interval_ms: 30_000,
            max_batch_size: 200,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> BatchResult<()> {
        if self.interval_ms == 0 {
            return Err(BatchError::InvalidConfig("interval_ms must be > 0".into()));
        }
        if self.max_batch_size == 0 {
            return Err(BatchError::InvalidConfig(
                "max_batch_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self::primary()
    }
}

// ============================================================================
// PendingBatch
// ============================================================================

/// Symbol -> latest update since the last flush.
///
/// `order` holds each pending symbol once. New symbols go to the back and a
/// coalesced overwrite keeps its slot, so symbols left over from a capped
/// flush are first in line next time.
#[derive(Debug, Default)]
struct PendingBatch {
    entries: HashMap<Symbol, PriceUpdate>,
    order: VecDeque<Symbol>,
}

impl PendingBatch {
    /// Insert or overwrite. Returns true when an unflushed value was replaced.
    fn insert(&mut self, update: PriceUpdate) -> bool {
        let symbol = update.symbol().clone();
        match self.entries.insert(symbol.clone(), update) {
            Some(_) => true,
            None => {
                self.order.push_back(symbol);
                false
            }
        }
    }

    /// Insert unless the pending value for the symbol was observed later.
    fn insert_unless_newer(&mut self, update: PriceUpdate) -> bool {
        let stale = self
            .entries
            .get(update.symbol())
            .is_some_and(|pending| pending.observed_at() > update.observed_at());
        if !stale {
            self.insert(update);
        }
        !stale
    }

    /// Remove up to `max` entries from the front.
    fn take(&mut self, max: usize) -> Vec<PriceUpdate> {
        let n = max.min(self.order.len());
        let mut batch = Vec::with_capacity(n);
        for symbol in self.order.drain(..n) {
            if let Some(update) = self.entries.remove(&symbol) {
                batch.push(update);
            }
        }
        batch
    }

    fn remove(&mut self, symbol: &Symbol) -> Option<PriceUpdate> {
        let update = self.entries.remove(symbol)?;
        self.order.retain(|s| s != symbol);
        Some(update)
    }

    fn symbols(&self) -> Vec<Symbol> {
        self.order.iter().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Default)]
struct BatcherInner {
    pending: PendingBatch,
    stats: BatchStats,
}

// ============================================================================
// UpdateBatcher
// ============================================================================

/// Coalescing batcher for one lane.
pub struct UpdateBatcher {
    lane: Lane,
    config: BatcherConfig,
    inner: Mutex<BatcherInner>,
    /// Serializes flushes so batches reach the sink in FIFO order.
    flush_lock: Mutex<()>,
    sink: Arc<dyn FlushSink>,
}

impl UpdateBatcher {
    pub fn new(lane: Lane, config: BatcherConfig, sink: Arc<dyn FlushSink>) -> BatchResult<Self> {
        config.validate()?;
        Ok(Self {
            lane,
            config,
            inner: Mutex::new(BatcherInner::default()),
            flush_lock: Mutex::new(()),
            sink,
        })
    }

    #[must_use]
    pub fn lane(&self) -> Lane {
        self.lane
    }

    #[must_use]
    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Store `update`, replacing any unflushed value for its symbol.
    pub fn enqueue(&self, update: PriceUpdate) {
        let mut inner = self.inner.lock();
        let coalesced = inner.pending.insert(update);
        inner.stats.record_received(coalesced);
    }

    pub fn enqueue_many<I>(&self, updates: I)
    where
        I: IntoIterator<Item = PriceUpdate>,
    {
        let mut inner = self.inner.lock();
        for update in updates {
            let coalesced = inner.pending.insert(update);
            inner.stats.record_received(coalesced);
        }
    }

    /// Insert without counting it as newly received (lane moves).
    ///
    /// A pending value observed later than `update` wins. Returns whether
    /// `update` was kept.
    pub(crate) fn adopt(&self, update: PriceUpdate) -> bool {
        self.inner.lock().pending.insert_unless_newer(update)
    }

    /// Remove a pending symbol (lane moves).
    pub(crate) fn take_symbol(&self, symbol: &Symbol) -> Option<PriceUpdate> {
        self.inner.lock().pending.remove(symbol)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    #[must_use]
    pub fn pending_symbols(&self) -> Vec<Symbol> {
        self.inner.lock().pending.symbols()
    }

    #[must_use]
    pub fn stats(&self) -> BatchStats {
        self.inner.lock().stats.clone()
    }

    /// Flush up to `max_batch_size` pending updates to the sink and return them.
    ///
    /// A no-op returning an empty batch when nothing is pending.
    pub fn flush_now(&self) -> Vec<PriceUpdate> {
        let _flush = self.flush_lock.lock();

        let (batch, remaining) = {
            let mut inner = self.inner.lock();
            let batch = inner.pending.take(self.config.max_batch_size);
            (batch, inner.pending.len())
        };

        if batch.is_empty() {
            return batch;
        }

        if remaining > 0 {
            warn!(
                lane = self.lane.as_str(),
                flushed = batch.len(),
                requeued = remaining,
                max_batch_size = self.config.max_batch_size,
                "Batch capacity exceeded, deferring remainder to next flush"
            );
            Metrics::batch_requeued(self.lane.as_str(), remaining);
        }

        let started = Instant::now();
        let result = self.sink.on_flush(self.lane, &batch);
        let elapsed = started.elapsed();

        if let Err(e) = &result {
            error!(
                lane = self.lane.as_str(),
                size = batch.len(),
                error = %e,
                "Flush callback failed, batch will not be re-delivered"
            );
            Metrics::batch_flush_error(self.lane.as_str());
        }

        let pending = {
            let mut inner = self.inner.lock();
            inner
                .stats
                .record_flush(batch.len(), elapsed, remaining, result.is_err());
            inner.pending.len()
        };

        Metrics::batch_flushed(self.lane.as_str(), batch.len());
        Metrics::batch_pending(self.lane.as_str(), pending);
        debug!(
            lane = self.lane.as_str(),
            size = batch.len(),
            pending,
            duration_us = elapsed.as_micros() as u64,
            "Batch flushed"
        );

        batch
    }

    /// Drive the flush timer until `cancel` fires, then drain what is left.
    ///
    /// The first flush happens one interval after start; later flushes are
    /// spaced one interval after the previous one regardless of bursts.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            lane = self.lane.as_str(),
            interval_ms = self.config.interval_ms,
            max_batch_size = self.config.max_batch_size,
            "Batcher started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.flush_now();
                }
            }
        }

        let mut drained = 0;
        while self.pending_count() > 0 {
            drained += self.flush_now().len();
        }
        info!(lane = self.lane.as_str(), drained, "Batcher stopped");
    }
}
