//! Mock price feed server for integration tests.
//!
//! Speaks enough of the ticker protocol to drive the connector:
//! - Acks each subscribed/unsubscribed symbol
//! - Answers `{"method":"ping"}` with a pong
//! - Pushes ticker frames to every open connection
//! - Drops all connections on demand
//!
//! Switches turn individual behaviors off to simulate a misbehaving feed.

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone)]
enum Control {
    Send(String),
    Drop,
}

/// Behaviors shared by every connection, read per message.
#[derive(Debug)]
struct Switches {
    answer_pings: AtomicBool,
    send_acks: AtomicBool,
    accept_subscriptions: AtomicBool,
}

impl Default for Switches {
    fn default() -> Self {
        Self {
            answer_pings: AtomicBool::new(true),
            send_acks: AtomicBool::new(true),
            accept_subscriptions: AtomicBool::new(true),
        }
    }
}

/// A mock feed server bound to a random local port.
pub struct MockFeedServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    control_tx: broadcast::Sender<Control>,
    messages: Arc<Mutex<VecDeque<String>>>,
    connections: Arc<Mutex<u32>>,
    switches: Arc<Switches>,
}

impl MockFeedServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let messages: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        let connections: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (control_tx, _) = broadcast::channel::<Control>(256);
        let switches = Arc::new(Switches::default());

        let messages_clone = messages.clone();
        let connections_clone = connections.clone();
        let control_clone = control_tx.clone();
        let switches_clone = switches.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(
                            stream,
                            messages_clone.clone(),
                            connections_clone.clone(),
                            control_clone.subscribe(),
                            switches_clone.clone(),
                        ));
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            control_tx,
            messages,
            connections,
            switches,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    pub async fn received_messages(&self) -> Vec<String> {
        self.messages.lock().await.iter().cloned().collect()
    }

    /// Received messages whose `method` field equals `method`.
    pub async fn received_with_method(&self, method: &str) -> Vec<serde_json::Value> {
        self.received_messages()
            .await
            .iter()
            .filter_map(|m| serde_json::from_str::<serde_json::Value>(m).ok())
            .filter(|v| v.get("method").and_then(|m| m.as_str()) == Some(method))
            .collect()
    }

    /// Push one ticker frame to every open connection.
    pub fn push_ticker(&self, symbol: &str, last: f64) {
        let frame = serde_json::json!({
            "channel": "ticker",
            "type": "update",
            "data": [{ "symbol": symbol, "last": last }]
        });
        let _ = self.control_tx.send(Control::Send(frame.to_string()));
    }

    /// Push an arbitrary text frame to every open connection.
    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.control_tx.send(Control::Send(text.into()));
    }

    /// Leave `{"method":"ping"}` unanswered from now on.
    pub fn stop_answering_pings(&self) {
        self.switches.answer_pings.store(false, Ordering::SeqCst);
    }

    /// Record subscribe/unsubscribe requests without acking them.
    pub fn suppress_acks(&self) {
        self.switches.send_acks.store(false, Ordering::SeqCst);
    }

    /// Answer subscribe requests with `success: false`.
    pub fn reject_subscriptions(&self) {
        self.switches.accept_subscriptions.store(false, Ordering::SeqCst);
    }

    /// Close every open connection from the server side.
    pub fn drop_connections(&self) {
        let _ = self.control_tx.send(Control::Drop);
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        self.drop_connections();
    }
}

/// Symbols listed in a `{"method":..., "params":{"symbol":[...]}}` request.
fn requested_symbols(request: &serde_json::Value) -> Vec<String> {
    request
        .get("params")
        .and_then(|p| p.get("symbol"))
        .and_then(|s| s.as_array())
        .map(|symbols| {
            symbols
                .iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

async fn handle_connection(
    stream: TcpStream,
    messages: Arc<Mutex<VecDeque<String>>>,
    connections: Arc<Mutex<u32>>,
    mut control_rx: broadcast::Receiver<Control>,
    switches: Arc<Switches>,
) {
    {
        let mut count = connections.lock().await;
        *count += 1;
    }

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    {
                        let mut msgs = messages.lock().await;
                        msgs.push_back(text.to_string());
                    }

                    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) else {
                        continue;
                    };
                    match parsed.get("method").and_then(|m| m.as_str()) {
                        Some("ping") if switches.answer_pings.load(Ordering::SeqCst) => {
                            let pong = serde_json::json!({ "method": "pong" });
                            let _ = write.send(Message::Text(pong.to_string().into())).await;
                        }
                        Some(method @ ("subscribe" | "unsubscribe"))
                            if switches.send_acks.load(Ordering::SeqCst) =>
                        {
                            let accepted = method == "unsubscribe"
                                || switches.accept_subscriptions.load(Ordering::SeqCst);
                            for symbol in requested_symbols(&parsed) {
                                let ack = if accepted {
                                    serde_json::json!({
                                        "method": method,
                                        "success": true,
                                        "result": { "channel": "ticker", "symbol": symbol }
                                    })
                                } else {
                                    serde_json::json!({
                                        "method": method,
                                        "success": false,
                                        "error": format!("Currency pair not supported {symbol}"),
                                        "result": { "channel": "ticker", "symbol": symbol }
                                    })
                                };
                                let _ = write.send(Message::Text(ack.to_string().into())).await;
                            }
                        }
                        _ => {}
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            control = control_rx.recv() => match control {
                Ok(Control::Send(text)) => {
                    let _ = write.send(Message::Text(text.into())).await;
                }
                Ok(Control::Drop) | Err(broadcast::error::RecvError::Closed) => {
                    let _ = write.close().await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}

/// Poll `check` every 20ms until it returns true or `within` elapses.
pub async fn wait_until<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(within, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_starts() {
        let server = MockFeedServer::start().await;
        assert!(server.url().starts_with("ws://127.0.0.1:"));
        server.shutdown().await;
    }
}
