//! Downstream dispatch with backpressure.
//!
//! Wraps the persistence service behind an ordered policy:
//! - Degraded-service pause with manual override
//! - Backoff windows from server retry hints
//! - Consecutive-failure circuit breaker
//! - Halved next batch after a hard failure while the breaker is closed

pub mod breaker;
pub mod client;
pub mod degraded;
pub mod error;
pub mod guard;
pub mod policy;
pub mod store;

pub use breaker::{BackoffWindow, CircuitBreaker};
pub use client::{DownstreamResponse, HttpClientConfig, HttpPersistenceClient, PersistenceClient};
pub use degraded::DegradedServiceState;
pub use error::{DispatchError, DispatchResult};
pub use guard::{DispatchGuard, DispatchOutcome, GuardConfig, GuardStatus};
pub use policy::{decide, Decision, GuardSnapshot, SkipReason};
pub use store::{GuardStateStore, JsonFileStateStore, MemoryStateStore};
