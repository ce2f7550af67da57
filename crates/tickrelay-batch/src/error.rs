//! Batching error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Flush sink closed")]
    SinkClosed,

    #[error("Flush sink full, batch of {0} not accepted")]
    SinkFull(usize),

    #[error("Flush callback failed: {0}")]
    Callback(String),

    #[error("Invalid batcher configuration: {0}")]
    InvalidConfig(String),
}

pub type BatchResult<T> = Result<T, BatchError>;
