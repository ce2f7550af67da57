//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Feed error: {0}")]
    Feed(#[from] tickrelay_ws::WsError),

    #[error("Batch error: {0}")]
    Batch(#[from] tickrelay_batch::BatchError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] tickrelay_dispatch::DispatchError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] tickrelay_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
