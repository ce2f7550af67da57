//! Feed connection state machine.
//!
//! A single driver task owns the WebSocket, the `ConnectionState` and the
//! subscription tracker. `FeedConnector` handles only send commands to it, so
//! transitions are serialized and no caller mutates state directly.
//!
//! ```text
//! Disconnected -> Connecting -> Subscribing -> Connected
//!                     ^              |             |
//!                     |              v             v
//!                     +-------- Reconnecting <-----+
//!                                    |
//!                                    v
//!                                 Failed
//! ```

use crate::error::{WsError, WsResult};
use crate::heartbeat::{KeepaliveAction, KeepaliveMonitor, KeepaliveStats};
use crate::message::{LegacySubscribeRequest, PingRequest, SubscriptionMethod, SubscriptionRequest};
use crate::parser::{parse_frame, ParsedFrame, SubscriptionAck};
use crate::reconnect::ReconnectPolicy;
use crate::subscription::SymbolSubscriptionTracker;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tickrelay_core::{normalize_symbols, PriceUpdate, Symbol};
use tickrelay_telemetry::{EventLevel, Metrics, ObservabilityEvent, SharedSink};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::{
    connect_async_tls_with_config, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const EVENT_SOURCE: &str = "feed";

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Primary WebSocket URL.
    pub url: String,
    /// Optional fallback URL, used by `connect_fallback`.
    pub fallback_url: Option<String>,
    /// When false, `connect` is a logged no-op.
    pub enabled: bool,
    /// Reconnects before giving up (0 = infinite).
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Keepalive ping interval once connected.
    pub ping_interval_ms: u64,
    /// Pong must arrive within this after a ping.
    pub pong_timeout_ms: u64,
    /// Without a subscribe ack, assume subscribed after this long.
    pub subscribe_timeout_ms: u64,
    /// Send a legacy-generation subscribe after the primary one.
    pub legacy_subscribe_enabled: bool,
    pub legacy_subscribe_delay_ms: u64,
    /// Capacity of the event channel handed to the caller.
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            fallback_url: None,
            enabled: true,
            max_reconnect_attempts: 10,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 60000,
            connect_timeout_ms: 10000,
            ping_interval_ms: 30000,
            pong_timeout_ms: 5000,
            subscribe_timeout_ms: 5000,
            legacy_subscribe_enabled: false,
            legacy_subscribe_delay_ms: 1000,
            event_buffer: 1024,
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            Duration::from_millis(self.reconnect_max_delay_ms),
            self.max_reconnect_attempts,
        )
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribing,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    /// Whether the state machine allows moving to `next`.
    ///
    /// Re-entering `Connecting` is allowed from every state: a manual
    /// connect cancels whatever is in flight and starts fresh.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Connecting) => true,
            (_, Disconnected) => true,
            (Connecting, Subscribing) => true,
            (Subscribing, Connected) => true,
            (Connecting | Subscribing | Connected, Reconnecting) => true,
            (Connecting | Subscribing | Connected | Reconnecting, Failed) => true,
            _ => false,
        }
    }

    /// Transport is open (subscribe messages can be sent).
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Subscribing | Self::Connected)
    }

    fn event_level(&self) -> EventLevel {
        match self {
            Self::Connected => EventLevel::Success,
            Self::Reconnecting => EventLevel::Warning,
            Self::Failed => EventLevel::Error,
            _ => EventLevel::Info,
        }
    }

    fn event_message(&self) -> &'static str {
        match self {
            Self::Disconnected => "Feed disconnected",
            Self::Connecting => "Connecting to feed",
            Self::Subscribing => "Feed transport open, subscribing",
            Self::Connected => "Feed connected",
            Self::Reconnecting => "Feed connection lost, reconnecting",
            Self::Failed => "Feed reconnect attempts exhausted, manual reconnect required",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which configured endpoint to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    #[default]
    Primary,
    Fallback,
}

/// Events delivered to the caller.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Parsed prices from one frame.
    Prices(Vec<PriceUpdate>),
    /// State transition, with the error that caused it if any.
    Status {
        state: ConnectionState,
        error: Option<String>,
    },
}

/// Point-in-time view of the connector.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectorSnapshot {
    pub state: Option<ConnectionState>,
    pub attempt: u32,
    /// Reconnect budget, 0 when unlimited.
    pub max_attempts: u32,
    pub endpoint: Endpoint,
    pub subscribed: Vec<Symbol>,
    /// Subscribed symbols the feed has acknowledged.
    pub acked: usize,
    pub keepalive: KeepaliveStats,
    pub last_error: Option<String>,
}

impl ConnectorSnapshot {
    pub fn state(&self) -> ConnectionState {
        self.state.unwrap_or(ConnectionState::Disconnected)
    }
}

#[derive(Debug)]
enum Command {
    Connect {
        symbols: Option<BTreeSet<Symbol>>,
        endpoint: Endpoint,
    },
    UpdateSymbols(BTreeSet<Symbol>),
    Disconnect,
    Shutdown,
}

/// Handle to the feed connector driver. Cheap to clone.
#[derive(Clone)]
pub struct FeedConnector {
    cmd_tx: mpsc::UnboundedSender<Command>,
    snapshot: Arc<RwLock<ConnectorSnapshot>>,
    has_fallback: bool,
}

impl FeedConnector {
    /// Spawn the driver task.
    ///
    /// Returns the handle, the event receiver and the driver's join handle.
    /// The connector starts `Disconnected`; call `connect` to start.
    pub fn spawn(
        config: ConnectionConfig,
        sink: SharedSink,
    ) -> (Self, mpsc::Receiver<FeedEvent>, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let snapshot = Arc::new(RwLock::new(ConnectorSnapshot {
            max_attempts: config.reconnect_policy().max_attempts(),
            ..Default::default()
        }));
        let has_fallback = config.fallback_url.is_some();

        let driver = Driver::new(config, cmd_rx, events_tx, snapshot.clone(), sink);
        let handle = tokio::spawn(driver.run());

        (
            Self {
                cmd_tx,
                snapshot,
                has_fallback,
            },
            events_rx,
            handle,
        )
    }

    /// Connect (or reconnect from scratch) to the primary endpoint.
    ///
    /// Cancels any in-flight attempt or backoff and resets the attempt counter.
    pub fn connect<I, S>(&self, symbols: I) -> WsResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.send(Command::Connect {
            symbols: Some(normalize_symbols(symbols)),
            endpoint: Endpoint::Primary,
        })
    }

    /// Connect to the fallback endpoint.
    pub fn connect_fallback<I, S>(&self, symbols: I) -> WsResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.has_fallback {
            return Err(WsError::NoFallback);
        }
        self.send(Command::Connect {
            symbols: Some(normalize_symbols(symbols)),
            endpoint: Endpoint::Fallback,
        })
    }

    /// Manual reconnect with the current symbol set, regardless of cooldowns.
    pub fn reconnect(&self) -> WsResult<()> {
        let endpoint = self.snapshot.read().endpoint;
        self.send(Command::Connect {
            symbols: None,
            endpoint,
        })
    }

    /// Replace the watched symbol set. Only the delta is sent to the feed.
    pub fn update_symbols<I, S>(&self, symbols: I) -> WsResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.send(Command::UpdateSymbols(normalize_symbols(symbols)))
    }

    /// Close the transport and cancel any pending reconnect.
    pub fn disconnect(&self) -> WsResult<()> {
        self.send(Command::Disconnect)
    }

    /// Stop the driver task.
    pub fn shutdown(&self) {
        info!("Feed connector shutdown requested");
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.read().state()
    }

    pub fn snapshot(&self) -> ConnectorSnapshot {
        self.snapshot.read().clone()
    }

    fn send(&self, cmd: Command) -> WsResult<()> {
        self.cmd_tx.send(cmd).map_err(|_| WsError::DriverStopped)
    }
}

/// Why a live or pending connection stopped at the caller's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Restart,
    Disconnect,
    Shutdown,
}

enum SessionEnd {
    Idle,
    Shutdown,
}

struct Driver {
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
    endpoint: Endpoint,
    desired: BTreeSet<Symbol>,
    tracker: SymbolSubscriptionTracker,
    keepalive: KeepaliveMonitor,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::Sender<FeedEvent>,
    snapshot: Arc<RwLock<ConnectorSnapshot>>,
    sink: SharedSink,
}

impl Driver {
    fn new(
        config: ConnectionConfig,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        events_tx: mpsc::Sender<FeedEvent>,
        snapshot: Arc<RwLock<ConnectorSnapshot>>,
        sink: SharedSink,
    ) -> Self {
        let keepalive = KeepaliveMonitor::new(
            Duration::from_millis(config.ping_interval_ms),
            Duration::from_millis(config.pong_timeout_ms),
        );
        Self {
            policy: config.reconnect_policy(),
            config,
            state: ConnectionState::Disconnected,
            attempt: 0,
            endpoint: Endpoint::Primary,
            desired: BTreeSet::new(),
            tracker: SymbolSubscriptionTracker::new(),
            keepalive,
            cmd_rx,
            events_tx,
            snapshot,
            sink,
        }
    }

    async fn run(mut self) {
        Metrics::feed_state_set(self.state.as_str());
        debug!("Feed connector driver started");

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Connect { symbols, endpoint } => {
                    if let Some(symbols) = symbols {
                        self.desired = symbols;
                    }
                    self.endpoint = endpoint;
                    self.attempt = 0;

                    if !self.config.enabled {
                        warn!("Feed disabled in configuration, ignoring connect");
                        self.sink.emit(ObservabilityEvent::warning(
                            EVENT_SOURCE,
                            "Feed is disabled, connect ignored",
                        ));
                        continue;
                    }

                    if let SessionEnd::Shutdown = self.run_session().await {
                        break;
                    }
                }
                Command::UpdateSymbols(symbols) => {
                    debug!(count = symbols.len(), "Symbols updated while offline");
                    self.desired = symbols;
                }
                Command::Disconnect => {
                    if self.state != ConnectionState::Disconnected {
                        self.transition(ConnectionState::Disconnected, None).await;
                    }
                }
                Command::Shutdown => break,
            }
        }

        if self.state != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected, None).await;
        }
        info!("Feed connector driver stopped");
    }

    /// Connect and keep reconnecting until interrupted or exhausted.
    async fn run_session(&mut self) -> SessionEnd {
        loop {
            let lost = match self.connect_once().await {
                Ok(Interrupt::Restart) => {
                    self.attempt = 0;
                    continue;
                }
                Ok(interrupt) => return self.stop(interrupt).await,
                Err(e) => e,
            };

            if self.policy.is_exhausted(self.attempt) {
                let exhausted = WsError::ExhaustedReconnect {
                    attempts: self.attempt,
                };
                error!(attempts = self.attempt, last_error = %lost, "Max reconnection attempts reached");
                self.transition(ConnectionState::Failed, Some(exhausted.to_string()))
                    .await;
                return SessionEnd::Idle;
            }

            let delay = self.policy.delay_for(self.attempt);
            self.attempt += 1;
            Metrics::feed_reconnect(lost.kind());
            warn!(
                attempt = self.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %lost,
                "Reconnecting"
            );
            self.transition(ConnectionState::Reconnecting, Some(lost.to_string()))
                .await;

            match self.wait_backoff(delay).await {
                None => {}
                Some(Interrupt::Restart) => self.attempt = 0,
                Some(interrupt) => return self.stop(interrupt).await,
            }
        }
    }

    async fn stop(&mut self, interrupt: Interrupt) -> SessionEnd {
        self.transition(ConnectionState::Disconnected, None).await;
        if interrupt == Interrupt::Shutdown {
            SessionEnd::Shutdown
        } else {
            SessionEnd::Idle
        }
    }

    /// Cancellation-aware backoff sleep.
    async fn wait_backoff(&mut self, delay: Duration) -> Option<Interrupt> {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                () = sleep_until(deadline) => return None,
                cmd = self.cmd_rx.recv() => {
                    if let Some(interrupt) = self.interrupt_for(cmd) {
                        info!(?interrupt, "Backoff interrupted");
                        return Some(interrupt);
                    }
                }
            }
        }
    }

    /// Apply a command received while no transport is open.
    fn interrupt_for(&mut self, cmd: Option<Command>) -> Option<Interrupt> {
        match cmd {
            None | Some(Command::Shutdown) => Some(Interrupt::Shutdown),
            Some(Command::Disconnect) => Some(Interrupt::Disconnect),
            Some(Command::Connect { symbols, endpoint }) => {
                if let Some(symbols) = symbols {
                    self.desired = symbols;
                }
                self.endpoint = endpoint;
                Some(Interrupt::Restart)
            }
            Some(Command::UpdateSymbols(symbols)) => {
                self.desired = symbols;
                None
            }
        }
    }

    fn current_url(&self) -> &str {
        match (self.endpoint, &self.config.fallback_url) {
            (Endpoint::Fallback, Some(url)) => url,
            _ => &self.config.url,
        }
    }

    /// One connection lifetime. `Ok` means the caller asked us to stop.
    async fn connect_once(&mut self) -> WsResult<Interrupt> {
        self.transition(ConnectionState::Connecting, None).await;

        let url = self.current_url().to_string();
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        info!(url = %url, attempt = self.attempt, "Connecting to feed");

        let connect = tokio::time::timeout(
            connect_timeout,
            connect_async_tls_with_config(url.as_str(), None, true, None),
        );
        tokio::pin!(connect);

        let stream = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(Ok((stream, _response))) => break stream,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(WsError::ConnectTimeout(connect_timeout)),
                },
                cmd = self.cmd_rx.recv() => {
                    if let Some(interrupt) = self.interrupt_for(cmd) {
                        return Ok(interrupt);
                    }
                }
            }
        };

        let (mut write, mut read) = stream.split();
        let result = self.drive(&mut write, &mut read).await;

        if result.is_ok() {
            if let Err(e) = write.send(Message::Close(None)).await {
                debug!(error = %e, "Failed to send Close frame");
            }
        }

        // The server drops subscriptions with the socket.
        self.tracker.reset();
        self.publish_subscriptions();
        result
    }

    /// Message loop for an open transport.
    async fn drive(&mut self, write: &mut WsSink, read: &mut WsSource) -> WsResult<Interrupt> {
        self.transition(ConnectionState::Subscribing, None).await;

        let initial = self.desired.clone();
        if !initial.is_empty() {
            self.send_subscription(write, SubscriptionMethod::Subscribe, &initial)
                .await?;
        }
        self.tracker.replace(initial);
        self.publish_subscriptions();

        let mut subscribe_deadline = None;
        if self.tracker.current().is_empty() {
            self.mark_connected().await;
        } else {
            subscribe_deadline =
                Some(Instant::now() + Duration::from_millis(self.config.subscribe_timeout_ms));
        }

        let mut legacy_at = (self.config.legacy_subscribe_enabled
            && !self.tracker.current().is_empty())
        .then(|| Instant::now() + Duration::from_millis(self.config.legacy_subscribe_delay_ms));

        loop {
            let connected = self.state == ConnectionState::Connected;
            let keepalive_at = self.keepalive.next_deadline();
            let now = Instant::now();

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::UpdateSymbols(symbols)) => {
                        self.desired = symbols;
                        self.apply_delta(write).await?;
                    }
                    other => {
                        if let Some(interrupt) = self.interrupt_for(other) {
                            info!(?interrupt, "Closing feed connection");
                            return Ok(interrupt);
                        }
                    }
                },

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_text(&text).await;
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.handle_text(&text).await,
                        Err(_) => {
                            warn!("Dropping non UTF-8 binary frame");
                            Metrics::frame_dropped("binary");
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        trace!("Received transport ping, sending pong");
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => trace!("Received transport pong"),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (f.code.into(), f.reason.to_string()))
                            .unwrap_or((1000, "Normal close".to_string()));
                        warn!(code, %reason, "Feed closed by server");
                        return Err(WsError::ConnectionClosed { code, reason });
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "Feed read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!("Feed stream ended");
                        return Err(WsError::ConnectionClosed {
                            code: 1006,
                            reason: "Stream ended".to_string(),
                        });
                    }
                },

                () = sleep_until(subscribe_deadline.unwrap_or(now)), if subscribe_deadline.is_some() => {
                    subscribe_deadline = None;
                    if self.state == ConnectionState::Subscribing {
                        warn!(
                            timeout_ms = self.config.subscribe_timeout_ms,
                            "No subscribe ack before timeout, assuming subscribed"
                        );
                        self.mark_connected().await;
                    }
                }

                () = sleep_until(legacy_at.unwrap_or(now)), if legacy_at.is_some() => {
                    legacy_at = None;
                    self.send_legacy_subscribe(write).await?;
                }

                () = sleep_until(keepalive_at), if connected => {
                    match self.keepalive.poll() {
                        KeepaliveAction::SendPing => {
                            let ping = serde_json::to_string(&PingRequest::new())?;
                            write.send(Message::Text(ping)).await?;
                            self.keepalive.record_ping();
                            self.publish_keepalive();
                            trace!("Sent keepalive ping");
                        }
                        KeepaliveAction::TimedOut => {
                            error!(
                                timeout_ms = self.config.pong_timeout_ms,
                                "Keepalive timeout"
                            );
                            return Err(WsError::HeartbeatTimeout(self.keepalive.pong_timeout()));
                        }
                        KeepaliveAction::Idle => {}
                    }
                }
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let frame = match parse_frame(text, Utc::now()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, frame = %truncate(text, 200), "Dropping malformed frame");
                Metrics::frame_dropped("malformed");
                return;
            }
        };

        match frame {
            ParsedFrame::Prices(updates) => {
                // Data on the channel proves the subscription is live.
                if self.state == ConnectionState::Subscribing {
                    self.mark_connected().await;
                }
                if updates.is_empty() {
                    Metrics::frame_dropped("empty_ticker");
                    return;
                }
                Metrics::price_updates(updates.len());
                if self.events_tx.send(FeedEvent::Prices(updates)).await.is_err() {
                    warn!("Feed event receiver dropped");
                }
            }
            ParsedFrame::Pong => {
                self.keepalive.record_pong();
                self.publish_keepalive();
            }
            ParsedFrame::Heartbeat => trace!("Feed heartbeat"),
            ParsedFrame::Status(status) => debug!(%status, "Feed system status"),
            ParsedFrame::Ack(ack) => self.handle_ack(ack).await,
            ParsedFrame::Ignored => trace!("Ignoring frame"),
        }
    }

    async fn handle_ack(&mut self, ack: SubscriptionAck) {
        if !ack.success {
            let err = WsError::Subscription(
                ack.error
                    .clone()
                    .unwrap_or_else(|| "subscription rejected".to_string()),
            );
            warn!(method = ack.method.as_str(), symbol = ?ack.symbol, error = %err, "Subscription rejected");
            if let (SubscriptionMethod::Subscribe, Some(symbol)) = (ack.method, &ack.symbol) {
                self.tracker.forget(symbol);
                self.publish_subscriptions();
            }
            let mut event = ObservabilityEvent::warning(EVENT_SOURCE, "Subscription rejected")
                .with_detail("method", ack.method.as_str())
                .with_detail("error", err.to_string());
            if let Some(symbol) = &ack.symbol {
                event = event.with_detail("symbol", symbol.as_str());
            }
            self.sink.emit(event);
            return;
        }

        if ack.method == SubscriptionMethod::Subscribe {
            if let Some(symbol) = &ack.symbol {
                self.tracker.mark_acked(symbol);
                self.publish_subscriptions();
            }
            if self.state == ConnectionState::Subscribing {
                self.mark_connected().await;
            }
        }
    }

    async fn mark_connected(&mut self) {
        self.attempt = 0;
        self.keepalive.reset();
        self.publish_keepalive();
        self.transition(ConnectionState::Connected, None).await;
    }

    async fn apply_delta(&mut self, write: &mut WsSink) -> WsResult<()> {
        let delta = self.tracker.plan(&self.desired);
        if delta.is_empty() {
            debug!("Symbol update produced no subscription change");
            return Ok(());
        }

        if !delta.to_remove.is_empty() {
            self.send_subscription(write, SubscriptionMethod::Unsubscribe, &delta.to_remove)
                .await?;
        }
        if !delta.to_add.is_empty() {
            self.send_subscription(write, SubscriptionMethod::Subscribe, &delta.to_add)
                .await?;
        }
        self.tracker.apply(&delta);
        self.publish_subscriptions();

        info!(
            added = delta.to_add.len(),
            removed = delta.to_remove.len(),
            "Feed subscriptions updated"
        );
        self.sink.emit(
            ObservabilityEvent::info(EVENT_SOURCE, "Feed subscriptions updated")
                .with_detail("added", symbol_list(&delta.to_add))
                .with_detail("removed", symbol_list(&delta.to_remove)),
        );
        Ok(())
    }

    async fn send_subscription(
        &mut self,
        write: &mut WsSink,
        method: SubscriptionMethod,
        symbols: &BTreeSet<Symbol>,
    ) -> WsResult<()> {
        let request = SubscriptionRequest::new(method, crate::message::TICKER_CHANNEL, symbols);
        let text = serde_json::to_string(&request)?;
        write.send(Message::Text(text)).await?;
        Metrics::subscription_message(method.as_str());
        debug!(method = method.as_str(), count = symbols.len(), "Subscription sent");
        Ok(())
    }

    async fn send_legacy_subscribe(&mut self, write: &mut WsSink) -> WsResult<()> {
        let symbols = self.tracker.current();
        if symbols.is_empty() {
            return Ok(());
        }
        let request = LegacySubscribeRequest::ticker(symbols);
        let text = serde_json::to_string(&request)?;
        write.send(Message::Text(text)).await?;
        Metrics::subscription_message("legacy_subscribe");
        debug!(count = symbols.len(), "Legacy subscription sent");
        Ok(())
    }

    fn publish_subscriptions(&self) {
        let mut snapshot = self.snapshot.write();
        snapshot.subscribed = self.tracker.current().iter().cloned().collect();
        snapshot.acked = self.tracker.acked_count();
    }

    fn publish_keepalive(&self) {
        self.snapshot.write().keepalive = self.keepalive.stats();
    }

    /// Record, meter, log and announce a state transition.
    async fn transition(&mut self, next: ConnectionState, error: Option<String>) {
        let prev = self.state;
        if !prev.can_transition_to(next) {
            warn!(from = %prev, to = %next, "Unexpected feed state transition");
        }
        self.state = next;

        {
            let mut snapshot = self.snapshot.write();
            snapshot.state = Some(next);
            snapshot.attempt = self.attempt;
            snapshot.endpoint = self.endpoint;
            if error.is_some() {
                snapshot.last_error = error.clone();
            }
        }

        Metrics::feed_state_set(next.as_str());
        debug!(from = %prev, to = %next, attempt = self.attempt, "Feed state transition");

        let mut event = ObservabilityEvent::new(next.event_level(), EVENT_SOURCE, next.event_message())
            .with_detail("from", prev.as_str())
            .with_detail("to", next.as_str())
            .with_detail("attempt", self.attempt)
            .with_detail("url", self.current_url());
        if let Some(err) = &error {
            event = event.with_detail("error", err.as_str());
        }
        self.sink.emit(event);

        let status = FeedEvent::Status { state: next, error };
        if self.events_tx.send(status).await.is_err() {
            debug!("Feed event receiver dropped");
        }
    }
}

fn symbol_list(symbols: &BTreeSet<Symbol>) -> Vec<String> {
    symbols.iter().map(Symbol::to_string).collect()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
