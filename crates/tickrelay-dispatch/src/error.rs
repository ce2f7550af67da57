//! Dispatch error types.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Downstream throttled (HTTP {status}), retry after {retry_after:?}")]
    Throttled {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("Downstream unavailable (HTTP {status}), retry after {retry_after:?}")]
    Unavailable {
        status: u16,
        retry_after: Option<Duration>,
        code: Option<String>,
    },

    #[error("Downstream rejected batch (HTTP {status}): {message}")]
    HardFailure { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DispatchError {
    /// Short label used for metrics and event details.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Throttled { .. } => "throttled",
            Self::Unavailable { .. } => "unavailable",
            Self::HardFailure { .. } => "hard_failure",
            Self::Transport(_) => "transport",
            Self::HttpClient(_) => "http_client",
            Self::Store(_) => "store",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
