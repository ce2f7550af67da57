//! Feed connector lifecycle integration tests.
//!
//! Runs the connector against a local mock feed:
//! - Connect and subscribe
//! - Price delivery
//! - Delta subscription updates
//! - Reconnection and exhaustion
//! - Keepalive timeout, unacked and rejected subscriptions, legacy subscribe
//! - Fallback endpoint

mod integration;
use integration::common::mock_feed::{wait_until, MockFeedServer};

use std::sync::Arc;
use std::time::Duration;
use tickrelay_telemetry::{MemorySink, SharedSink};
use tickrelay_ws::{ConnectionConfig, ConnectionState, Endpoint, FeedConnector, FeedEvent};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn test_config(url: String) -> ConnectionConfig {
    ConnectionConfig {
        url,
        reconnect_base_delay_ms: 20,
        reconnect_max_delay_ms: 100,
        max_reconnect_attempts: 5,
        connect_timeout_ms: 1000,
        ..Default::default()
    }
}

fn spawn_connector(
    config: ConnectionConfig,
) -> (
    FeedConnector,
    mpsc::Receiver<FeedEvent>,
    tokio::task::JoinHandle<()>,
    Arc<MemorySink>,
) {
    let sink = Arc::new(MemorySink::new());
    let (connector, events, driver) = FeedConnector::spawn(config, sink.clone() as SharedSink);
    (connector, events, driver, sink)
}

async fn wait_for_state(connector: &FeedConnector, state: ConnectionState) -> bool {
    wait_until(Duration::from_secs(3), || async { connector.state() == state }).await
}

/// Next price event, skipping status events.
async fn next_prices(events: &mut mpsc::Receiver<FeedEvent>) -> Vec<tickrelay_core::PriceUpdate> {
    timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if let FeedEvent::Prices(prices) = event {
                return prices;
            }
        }
        Vec::new()
    })
    .await
    .expect("price event within timeout")
}

fn subscribed(connector: &FeedConnector) -> Vec<String> {
    connector
        .snapshot()
        .subscribed
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

#[tokio::test]
async fn test_connects_and_subscribes() {
    let server = MockFeedServer::start().await;
    let (connector, _events, driver, sink) = spawn_connector(test_config(server.url()));

    connector.connect(["btc/usd", "ETH/USD"]).unwrap();
    assert!(
        wait_for_state(&connector, ConnectionState::Connected).await,
        "Should reach Connected after acks"
    );

    let subscribes = server.received_with_method("subscribe").await;
    assert_eq!(subscribes.len(), 1);
    assert_eq!(
        subscribes[0]["params"]["symbol"],
        serde_json::json!(["BTC/USD", "ETH/USD"])
    );
    assert_eq!(subscribes[0]["params"]["channel"], "ticker");

    let snapshot = connector.snapshot();
    assert_eq!(snapshot.subscribed.len(), 2);
    assert_eq!(sink.matching("Feed connected").len(), 1);

    connector.shutdown();
    driver.await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_ticker_frames_become_price_updates() {
    let server = MockFeedServer::start().await;
    let (connector, mut events, driver, _sink) = spawn_connector(test_config(server.url()));

    connector.connect(["BTC/USD"]).unwrap();
    assert!(wait_for_state(&connector, ConnectionState::Connected).await);

    server.push_ticker("BTC/USD", 64_250.5);

    let update = timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if let FeedEvent::Prices(prices) = event {
                if let Some(update) = prices.into_iter().next() {
                    return Some(update);
                }
            }
        }
        None
    })
    .await
    .expect("price update within timeout")
    .expect("event channel open");

    assert_eq!(update.symbol().as_str(), "BTC/USD");
    assert_eq!(update.price(), 64_250.5);

    connector.shutdown();
    driver.await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_update_symbols_sends_only_the_delta() {
    let server = MockFeedServer::start().await;
    let (connector, _events, driver, _sink) = spawn_connector(test_config(server.url()));

    connector.connect(["BTC/USD", "ETH/USD"]).unwrap();
    assert!(wait_for_state(&connector, ConnectionState::Connected).await);

    tokio_test::assert_ok!(connector.update_symbols(["ETH/USD", "SOL/USD"]));

    let updated = wait_until(Duration::from_secs(2), || async {
        server.received_with_method("subscribe").await.len() == 2
    })
    .await;
    assert!(updated, "Second subscribe should arrive");

    let unsubscribes = server.received_with_method("unsubscribe").await;
    assert_eq!(unsubscribes.len(), 1);
    assert_eq!(
        unsubscribes[0]["params"]["symbol"],
        serde_json::json!(["BTC/USD"])
    );

    let subscribes = server.received_with_method("subscribe").await;
    assert_eq!(
        subscribes[1]["params"]["symbol"],
        serde_json::json!(["SOL/USD"])
    );

    // Unsubscribe goes out before the subscribe
    let messages = server.received_messages().await;
    let unsub_at = messages
        .iter()
        .position(|m| m.contains("\"unsubscribe\""))
        .unwrap();
    let sub_at = messages
        .iter()
        .rposition(|m| m.contains("\"subscribe\"") && m.contains("SOL/USD"))
        .unwrap();
    assert!(unsub_at < sub_at);

    // Same set again is a no-op
    tokio_test::assert_ok!(connector.update_symbols(["SOL/USD", "ETH/USD"]));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.received_with_method("subscribe").await.len(), 2);
    assert_eq!(server.received_with_method("unsubscribe").await.len(), 1);

    connector.shutdown();
    driver.await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    let server = MockFeedServer::start().await;
    let (connector, _events, driver, _sink) = spawn_connector(test_config(server.url()));

    connector.connect(["BTC/USD"]).unwrap();
    assert!(wait_for_state(&connector, ConnectionState::Connected).await);
    assert_eq!(server.connection_count().await, 1);

    server.drop_connections();

    let reconnected = wait_until(Duration::from_secs(3), || async {
        server.connection_count().await >= 2 && connector.state() == ConnectionState::Connected
    })
    .await;
    assert!(reconnected, "Should reconnect and resubscribe");

    // Full set is subscribed again on the new connection
    let subscribes = server.received_with_method("subscribe").await;
    assert_eq!(subscribes.len(), 2);
    assert_eq!(subscribes[1]["params"]["symbol"], serde_json::json!(["BTC/USD"]));
    assert_eq!(connector.snapshot().attempt, 0);

    connector.shutdown();
    driver.await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_manual_reconnect_opens_new_connection() {
    let server = MockFeedServer::start().await;
    let (connector, _events, driver, _sink) = spawn_connector(test_config(server.url()));

    connector.connect(["BTC/USD"]).unwrap();
    assert!(wait_for_state(&connector, ConnectionState::Connected).await);

    connector.reconnect().unwrap();

    let reconnected = wait_until(Duration::from_secs(3), || async {
        server.connection_count().await == 2 && connector.state() == ConnectionState::Connected
    })
    .await;
    assert!(reconnected);

    connector.shutdown();
    driver.await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_reconnects_end_in_failed() {
    // Reserve a port, then free it so every connect is refused
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = ConnectionConfig {
        reconnect_base_delay_ms: 10,
        reconnect_max_delay_ms: 20,
        max_reconnect_attempts: 2,
        ..test_config(format!("ws://{}", addr))
    };
    let (connector, _events, driver, sink) = spawn_connector(config);

    connector.connect(["BTC/USD"]).unwrap();
    assert!(
        wait_for_state(&connector, ConnectionState::Failed).await,
        "Should give up after max attempts"
    );

    let snapshot = connector.snapshot();
    assert_eq!(snapshot.attempt, 2);
    assert_eq!(snapshot.max_attempts, 2);
    assert!(snapshot.last_error.is_some());
    assert!(!sink.matching("exhausted").is_empty());

    connector.shutdown();
    driver.await.unwrap();
}

#[tokio::test]
async fn test_missing_pong_forces_reconnect() {
    let server = MockFeedServer::start().await;
    server.stop_answering_pings();
    let config = ConnectionConfig {
        ping_interval_ms: 100,
        pong_timeout_ms: 100,
        ..test_config(server.url())
    };
    let (connector, mut events, driver, sink) = spawn_connector(config);

    connector.connect(["BTC/USD"]).unwrap();
    assert!(wait_for_state(&connector, ConnectionState::Connected).await);

    let lost = timeout(Duration::from_secs(3), async {
        while let Some(event) = events.recv().await {
            if let FeedEvent::Status {
                state: ConnectionState::Reconnecting,
                error,
            } = event
            {
                return error;
            }
        }
        None
    })
    .await
    .expect("Connected -> Reconnecting after the pong deadline");
    assert!(lost.unwrap_or_default().contains("No pong"));
    assert!(!sink.matching("Feed connection lost").is_empty());

    assert!(!server.received_with_method("ping").await.is_empty());
    let keepalive = connector.snapshot().keepalive;
    assert!(keepalive.pings_sent >= 1);
    assert_eq!(keepalive.pongs_received, 0);

    let reconnected = wait_until(Duration::from_secs(3), || async {
        server.connection_count().await >= 2
    })
    .await;
    assert!(reconnected, "A new connection follows the timeout");

    connector.shutdown();
    driver.await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_answered_pings_keep_connection() {
    let server = MockFeedServer::start().await;
    let config = ConnectionConfig {
        ping_interval_ms: 50,
        pong_timeout_ms: 500,
        ..test_config(server.url())
    };
    let (connector, _events, driver, _sink) = spawn_connector(config);

    connector.connect(["BTC/USD"]).unwrap();
    assert!(wait_for_state(&connector, ConnectionState::Connected).await);

    let ponged = wait_until(Duration::from_secs(3), || async {
        connector.snapshot().keepalive.pongs_received >= 2
    })
    .await;
    assert!(ponged);

    let snapshot = connector.snapshot();
    assert!(snapshot.keepalive.last_rtt_ms.is_some());
    assert_eq!(snapshot.state(), ConnectionState::Connected);
    assert_eq!(snapshot.max_attempts, 5);
    assert_eq!(server.connection_count().await, 1);

    connector.shutdown();
    driver.await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_timeout_assumes_subscribed() {
    let server = MockFeedServer::start().await;
    server.suppress_acks();
    let config = ConnectionConfig {
        subscribe_timeout_ms: 300,
        ..test_config(server.url())
    };
    let (connector, _events, driver, sink) = spawn_connector(config);

    let started = std::time::Instant::now();
    connector.connect(["BTC/USD"]).unwrap();
    assert!(
        wait_until(Duration::from_secs(1), || async {
            connector.state() == ConnectionState::Subscribing
        })
        .await,
        "Without an ack the connector waits in Subscribing"
    );

    assert!(wait_for_state(&connector, ConnectionState::Connected).await);
    assert!(started.elapsed() >= Duration::from_millis(300));

    let snapshot = connector.snapshot();
    assert_eq!(snapshot.acked, 0);
    assert_eq!(subscribed(&connector), vec!["BTC/USD"]);
    assert_eq!(server.received_with_method("subscribe").await.len(), 1);
    assert_eq!(sink.matching("Feed connected").len(), 1);

    connector.shutdown();
    driver.await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_legacy_subscribe_follows_primary() {
    let server = MockFeedServer::start().await;
    let config = ConnectionConfig {
        legacy_subscribe_enabled: true,
        legacy_subscribe_delay_ms: 50,
        ..test_config(server.url())
    };
    let (connector, _events, driver, _sink) = spawn_connector(config);

    connector.connect(["BTC/USD", "DOGE/USD"]).unwrap();

    let legacy_sent = wait_until(Duration::from_secs(2), || async {
        server
            .received_messages()
            .await
            .iter()
            .any(|m| m.contains("\"event\":\"subscribe\""))
    })
    .await;
    assert!(legacy_sent, "Legacy subscribe should follow the delay");

    let messages = server.received_messages().await;
    let legacy_at = messages
        .iter()
        .position(|m| m.contains("\"event\""))
        .unwrap();
    let primary_at = messages
        .iter()
        .position(|m| m.contains("\"method\":\"subscribe\""))
        .unwrap();
    assert!(primary_at < legacy_at);

    let legacy: serde_json::Value = serde_json::from_str(&messages[legacy_at]).unwrap();
    assert_eq!(legacy["pair"], serde_json::json!(["XBT/USD", "XDG/USD"]));
    assert_eq!(legacy["subscription"]["name"], "ticker");
    assert!(wait_for_state(&connector, ConnectionState::Connected).await);

    connector.shutdown();
    driver.await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_connect_fallback_dials_fallback_url() {
    let primary = MockFeedServer::start().await;
    let fallback = MockFeedServer::start().await;
    let config = ConnectionConfig {
        fallback_url: Some(fallback.url()),
        ..test_config(primary.url())
    };
    let (connector, _events, driver, _sink) = spawn_connector(config);

    tokio_test::assert_ok!(connector.connect_fallback(["BTC/USD"]));
    assert!(wait_for_state(&connector, ConnectionState::Connected).await);
    assert_eq!(connector.snapshot().endpoint, Endpoint::Fallback);
    assert_eq!(fallback.connection_count().await, 1);
    assert_eq!(fallback.received_with_method("subscribe").await.len(), 1);

    // Manual reconnect stays on the endpoint in use.
    connector.reconnect().unwrap();
    let reconnected = wait_until(Duration::from_secs(3), || async {
        fallback.connection_count().await == 2 && connector.state() == ConnectionState::Connected
    })
    .await;
    assert!(reconnected);
    assert_eq!(primary.connection_count().await, 0);

    connector.shutdown();
    driver.await.unwrap();
    primary.shutdown().await;
    fallback.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_and_rejected_ack_keep_state() {
    let server = MockFeedServer::start().await;
    let (connector, mut events, driver, sink) = spawn_connector(test_config(server.url()));

    connector.connect(["BTC/USD", "ETH/USD"]).unwrap();
    assert!(wait_for_state(&connector, ConnectionState::Connected).await);

    server.push_raw("this is not json");
    server.push_raw(
        serde_json::json!({
            "method": "subscribe",
            "success": false,
            "error": "Currency pair not supported",
            "result": { "channel": "ticker", "symbol": "ETH/USD" }
        })
        .to_string(),
    );
    server.push_ticker("BTC/USD", 42.0);

    // Frames are handled in order, so the ticker proves the bad ones were seen.
    let prices = next_prices(&mut events).await;
    assert_eq!(prices[0].price(), 42.0);

    assert_eq!(connector.state(), ConnectionState::Connected);
    assert_eq!(subscribed(&connector), vec!["BTC/USD"]);
    assert_eq!(sink.matching("Subscription rejected").len(), 1);
    assert_eq!(sink.matching("Feed connected").len(), 1);
    assert_eq!(server.connection_count().await, 1);

    connector.shutdown();
    driver.await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_rejected_subscription_is_forgotten() {
    let server = MockFeedServer::start().await;
    let (connector, _events, driver, sink) = spawn_connector(test_config(server.url()));

    connector.connect(["BTC/USD"]).unwrap();
    assert!(wait_for_state(&connector, ConnectionState::Connected).await);

    server.reject_subscriptions();
    connector.update_symbols(["BTC/USD", "DOGE/USD"]).unwrap();

    let rejected = wait_until(Duration::from_secs(2), || async {
        !sink.matching("Subscription rejected").is_empty()
    })
    .await;
    assert!(rejected);
    assert_eq!(subscribed(&connector), vec!["BTC/USD"]);
    assert_eq!(connector.state(), ConnectionState::Connected);

    connector.shutdown();
    driver.await.unwrap();
    server.shutdown().await;
}
