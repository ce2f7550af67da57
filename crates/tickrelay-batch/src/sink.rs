//! Flush destinations.

use crate::error::{BatchError, BatchResult};
use crate::lanes::Lane;
use tickrelay_core::PriceUpdate;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Receives each flushed batch.
///
/// Called synchronously from the flush path; implementations must not block.
/// An error is logged and counted by the batcher but the batch is never
/// re-delivered, so retrying is the sink's own responsibility.
pub trait FlushSink: Send + Sync {
    fn on_flush(&self, lane: Lane, batch: &[PriceUpdate]) -> BatchResult<()>;
}

impl<F> FlushSink for F
where
    F: Fn(Lane, &[PriceUpdate]) -> BatchResult<()> + Send + Sync,
{
    fn on_flush(&self, lane: Lane, batch: &[PriceUpdate]) -> BatchResult<()> {
        self(lane, batch)
    }
}

/// A flushed batch tagged with its lane.
#[derive(Debug, Clone)]
pub struct LaneBatch {
    pub lane: Lane,
    pub updates: Vec<PriceUpdate>,
}

/// Hands batches to an async consumer (the dispatcher) over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelFlushSink {
    tx: mpsc::Sender<LaneBatch>,
}

impl ChannelFlushSink {
    pub fn new(tx: mpsc::Sender<LaneBatch>) -> Self {
        Self { tx }
    }

    /// Create a sink and the matching receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LaneBatch>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl FlushSink for ChannelFlushSink {
    fn on_flush(&self, lane: Lane, batch: &[PriceUpdate]) -> BatchResult<()> {
        let batch = LaneBatch {
            lane,
            updates: batch.to_vec(),
        };
        match self.tx.try_send(batch) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(b)) => Err(BatchError::SinkFull(b.updates.len())),
            Err(TrySendError::Closed(_)) => Err(BatchError::SinkClosed),
        }
    }
}
