//! Downstream persistence client.
//!
//! `PersistenceClient` is the port the guard calls through. The HTTP
//! implementation posts `{"updates":[{"symbol","lastPrice"}]}` and turns the
//! reply into a `DownstreamResponse` without judging it; classification into
//! success, throttled, unavailable or hard failure happens in the guard.

use crate::error::{DispatchError, DispatchResult};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tickrelay_core::PriceUpdate;
use tracing::debug;

/// Default timeout for downstream requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw downstream reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownstreamResponse {
    pub status: u16,
    /// Soft-success: downstream accepted the batch but is itself degraded.
    pub degraded: bool,
    pub processed_count: Option<usize>,
    /// Server retry hint (`retryAfterMs` body field or `Retry-After` header).
    pub retry_after: Option<Duration>,
    pub code: Option<String>,
    pub message: Option<String>,
}

impl DownstreamResponse {
    pub fn ok() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after = Some(Duration::from_millis(ms));
        self
    }

    #[must_use]
    pub fn degraded(mut self) -> Self {
        self.degraded = true;
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one batch downstream.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceClient: Send + Sync {
    /// Transport failures are `Err`; any HTTP reply, including error
    /// statuses, is `Ok`.
    async fn send(&self, batch: &[PriceUpdate]) -> DispatchResult<DownstreamResponse>;
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct UpdateEntry<'a> {
    symbol: &'a str,
    #[serde(rename = "lastPrice")]
    last_price: f64,
}

#[derive(Debug, Serialize)]
struct UpdatesRequest<'a> {
    updates: Vec<UpdateEntry<'a>>,
}

impl<'a> UpdatesRequest<'a> {
    fn from_batch(batch: &'a [PriceUpdate]) -> Self {
        Self {
            updates: batch
                .iter()
                .map(|u| UpdateEntry {
                    symbol: u.symbol().as_str(),
                    last_price: u.price(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseBody {
    #[serde(default)]
    degraded: bool,
    processed_count: Option<usize>,
    retry_after_ms: Option<u64>,
    code: Option<String>,
    #[serde(alias = "message")]
    error: Option<String>,
}

// ============================================================================
// HttpPersistenceClient
// ============================================================================

/// Settings for the HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub endpoint: String,
    pub timeout: Duration,
    /// Negotiate gzip-compressed responses.
    pub compression_enabled: bool,
}

impl HttpClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
            compression_enabled: true,
        }
    }
}

pub struct HttpPersistenceClient {
    client: Client,
    endpoint: String,
}

impl HttpPersistenceClient {
    pub fn new(config: HttpClientConfig) -> DispatchResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .gzip(config.compression_enabled)
            .build()
            .map_err(|e| DispatchError::HttpClient(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PersistenceClient for HttpPersistenceClient {
    async fn send(&self, batch: &[PriceUpdate]) -> DispatchResult<DownstreamResponse> {
        let request = UpdatesRequest::from_batch(batch);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(format!("HTTP request failed: {e}")))?;

        let status = response.status().as_u16();
        let header_retry = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        // Error replies often carry no JSON body.
        let text = response.text().await.unwrap_or_default();
        let body: ResponseBody = if text.trim().is_empty() {
            ResponseBody::default()
        } else {
            serde_json::from_str(&text).unwrap_or_else(|e| {
                debug!(status, error = %e, "Downstream body is not JSON");
                ResponseBody {
                    error: Some(text.chars().take(200).collect()),
                    ..Default::default()
                }
            })
        };

        Ok(DownstreamResponse {
            status,
            degraded: body.degraded,
            processed_count: body.processed_count,
            retry_after: body
                .retry_after_ms
                .map(Duration::from_millis)
                .or(header_retry),
            code: body.code,
            message: body.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tickrelay_core::Symbol;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn update(symbol: &str, price: f64) -> PriceUpdate {
        PriceUpdate::now(Symbol::parse(symbol).unwrap(), price).unwrap()
    }

    async fn client_for(server: &MockServer) -> HttpPersistenceClient {
        let mut config = HttpClientConfig::new(format!("{}/prices", server.uri()));
        config.timeout = Duration::from_secs(2);
        HttpPersistenceClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_posts_updates_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prices"))
            .and(body_json(json!({
                "updates": [
                    {"symbol": "BTC/USD", "lastPrice": 50000.5},
                    {"symbol": "ETH/USD", "lastPrice": 3000.0}
                ]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"degraded": true, "processedCount": 2})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let response = client
            .send(&[update("BTC/USD", 50000.5), update("ETH/USD", 3000.0)])
            .await
            .unwrap();

        assert!(response.is_success());
        assert!(response.degraded);
        assert_eq!(response.processed_count, Some(2));
    }

    #[tokio::test]
    async fn test_retry_hint_from_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_json(json!({"retryAfterMs": 3000, "code": "DB_DOWN"})),
            )
            .mount(&server)
            .await;

        let response = client_for(&server)
            .await
            .send(&[update("BTC/USD", 1.0)])
            .await
            .unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(response.retry_after, Some(Duration::from_millis(3000)));
        assert_eq!(response.code.as_deref(), Some("DB_DOWN"));
    }

    #[tokio::test]
    async fn test_retry_hint_from_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2"))
            .mount(&server)
            .await;

        let response = client_for(&server)
            .await
            .send(&[update("BTC/USD", 1.0)])
            .await
            .unwrap();
        assert_eq!(response.status, 429);
        assert_eq!(response.retry_after, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_non_json_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
            .mount(&server)
            .await;

        let response = client_for(&server)
            .await
            .send(&[update("BTC/USD", 1.0)])
            .await
            .unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(response.message.as_deref(), Some("internal error"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let client = HttpPersistenceClient::new(HttpClientConfig::new(uri)).unwrap();
        let err = client.send(&[update("BTC/USD", 1.0)]).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
    }
}
