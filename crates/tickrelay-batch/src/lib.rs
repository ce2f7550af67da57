//! Price update batching.
//!
//! Coalesces rapid-fire per-symbol updates into bounded, periodic batches:
//! - Latest-value-wins per symbol within a flush window
//! - Fixed-cadence flush timer, bounded batch size, overflow requeue
//! - Two independently configured lanes with caller-defined routing

pub mod batcher;
pub mod error;
pub mod lanes;
pub mod sink;
pub mod stats;

pub use batcher::{BatcherConfig, UpdateBatcher};
pub use error::{BatchError, BatchResult};
pub use lanes::{DualLaneBatcher, Lane, LaneRouter};
pub use sink::{ChannelFlushSink, FlushSink, LaneBatch};
pub use stats::BatchStats;
