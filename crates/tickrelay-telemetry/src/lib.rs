//! Observability for the tickrelay pipeline.
//!
//! - Prometheus metrics for feed, batching and dispatch
//! - Structured logging with tracing (pretty in development, JSON in production)
//! - Leveled observability events for an external log sink or UI

pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use events::{
    BroadcastSink, EventLevel, EventSink, FanoutSink, MemorySink, ObservabilityEvent, SharedSink,
    TracingSink,
};
pub use logging::init_logging;
pub use metrics::Metrics;
