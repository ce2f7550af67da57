//! WebSocket price feed connector.
//!
//! Provides a resilient feed connection with:
//! - Explicit connect/subscribe/keepalive/reconnect state machine
//! - Exponential reconnect backoff with a bounded attempt count
//! - Delta-only subscription updates
//! - Defensive frame parsing (malformed frames are dropped, never fatal)

pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod parser;
pub mod reconnect;
pub mod subscription;

pub use connection::{
    ConnectionConfig, ConnectionState, ConnectorSnapshot, Endpoint, FeedConnector, FeedEvent,
};
pub use error::{WsError, WsResult};
pub use heartbeat::{KeepaliveAction, KeepaliveMonitor, KeepaliveStats};
pub use message::{LegacySubscribeRequest, PingRequest, SubscriptionMethod, SubscriptionRequest};
pub use parser::{parse_frame, ParsedFrame, SubscriptionAck};
pub use reconnect::ReconnectPolicy;
pub use subscription::{diff, diff_sets, SubscriptionDelta, SymbolSubscriptionTracker};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any feed or downstream connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
