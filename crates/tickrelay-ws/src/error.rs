//! Feed connector error types.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Message parse error: {0}")]
    Parse(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("No pong received within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ExhaustedReconnect { attempts: u32 },

    #[error("No fallback endpoint configured")]
    NoFallback,

    #[error("Feed connector stopped")]
    DriverStopped,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WsError {
    /// Short label used for metrics and event details.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::ConnectionClosed { .. } => "closed",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::Parse(_) => "parse",
            Self::Subscription(_) => "subscription",
            Self::HeartbeatTimeout(_) => "heartbeat_timeout",
            Self::ExhaustedReconnect { .. } => "exhausted",
            Self::NoFallback => "no_fallback",
            Self::DriverStopped => "stopped",
            Self::Json(_) => "json",
        }
    }
}

pub type WsResult<T> = Result<T, WsError>;
