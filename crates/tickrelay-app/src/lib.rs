//! tickrelay: real-time price feed ingestion.
//!
//! Orchestrates all components:
//! - WebSocket price feed with reconnect and delta subscriptions
//! - Two-lane update batching (priority symbols flush faster)
//! - Guarded dispatch to the persistence service
//! - Observability events for logs and UI subscribers

pub mod app;
pub mod config;
pub mod error;

pub use app::{AppStatus, Application, ControlHandle, RunningApp};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
