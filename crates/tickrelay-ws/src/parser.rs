//! Inbound frame parsing.
//!
//! Frames are parsed leniently: anything that cannot be understood becomes
//! a `WsError::Parse` which the connector logs and drops. Control frames are
//! classified so the connector can consume them instead of forwarding them.

use crate::error::{WsError, WsResult};
use crate::message::{from_legacy_pair, SubscriptionMethod, TICKER_CHANNEL};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tickrelay_core::{normalize_symbol, PriceUpdate, Symbol};
use tracing::debug;

/// Acknowledgement of a subscribe/unsubscribe request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionAck {
    pub method: SubscriptionMethod,
    pub success: bool,
    pub symbol: Option<Symbol>,
    pub error: Option<String>,
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    /// Ticker data. May be empty if every entry in the frame was invalid.
    Prices(Vec<PriceUpdate>),
    /// Application-level pong.
    Pong,
    /// Server heartbeat.
    Heartbeat,
    /// Exchange system status.
    Status(String),
    /// Subscribe/unsubscribe acknowledgement.
    Ack(SubscriptionAck),
    /// Well-formed but irrelevant (other channels, unknown methods).
    Ignored,
}

/// Parse a text frame received at `observed_at`.
pub fn parse_frame(text: &str, observed_at: DateTime<Utc>) -> WsResult<ParsedFrame> {
    let value: Value = serde_json::from_str(text).map_err(|e| WsError::Parse(e.to_string()))?;

    match &value {
        Value::Object(map) => parse_object(map, observed_at),
        Value::Array(items) => parse_legacy_array(items, observed_at),
        _ => Err(WsError::Parse("frame is neither an object nor an array".into())),
    }
}

fn parse_object(map: &Map<String, Value>, observed_at: DateTime<Utc>) -> WsResult<ParsedFrame> {
    if let Some(method) = map.get("method").and_then(Value::as_str) {
        return Ok(match method {
            "pong" => ParsedFrame::Pong,
            "subscribe" => ParsedFrame::Ack(parse_ack(SubscriptionMethod::Subscribe, map)),
            "unsubscribe" => ParsedFrame::Ack(parse_ack(SubscriptionMethod::Unsubscribe, map)),
            _ => ParsedFrame::Ignored,
        });
    }

    if let Some(channel) = map.get("channel").and_then(Value::as_str) {
        return match channel {
            "heartbeat" => Ok(ParsedFrame::Heartbeat),
            "status" => Ok(ParsedFrame::Status(status_text(map.get("data")))),
            TICKER_CHANNEL => parse_ticker(map, observed_at),
            _ => Ok(ParsedFrame::Ignored),
        };
    }

    if let Some(event) = map.get("event").and_then(Value::as_str) {
        return Ok(match event {
            "heartbeat" => ParsedFrame::Heartbeat,
            "pong" => ParsedFrame::Pong,
            "systemStatus" => ParsedFrame::Status(
                map.get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            ),
            "subscriptionStatus" => ParsedFrame::Ack(parse_legacy_ack(map)),
            _ => ParsedFrame::Ignored,
        });
    }

    Err(WsError::Parse(
        "object frame has no method, channel or event".into(),
    ))
}

fn parse_ack(method: SubscriptionMethod, map: &Map<String, Value>) -> SubscriptionAck {
    let symbol = map
        .get("result")
        .and_then(|r| r.get("symbol"))
        .and_then(Value::as_str)
        .and_then(|s| Symbol::parse(s).ok());

    SubscriptionAck {
        method,
        success: map.get("success").and_then(Value::as_bool).unwrap_or(true),
        symbol,
        error: map.get("error").and_then(Value::as_str).map(str::to_string),
    }
}

fn parse_legacy_ack(map: &Map<String, Value>) -> SubscriptionAck {
    let status = map.get("status").and_then(Value::as_str).unwrap_or("");
    let method = if status == "unsubscribed" {
        SubscriptionMethod::Unsubscribe
    } else {
        SubscriptionMethod::Subscribe
    };

    SubscriptionAck {
        method,
        success: status != "error",
        symbol: map
            .get("pair")
            .and_then(Value::as_str)
            .and_then(legacy_symbol),
        error: map
            .get("errorMessage")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn status_text(data: Option<&Value>) -> String {
    data.and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|first| first.get("system"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn parse_ticker(map: &Map<String, Value>, observed_at: DateTime<Utc>) -> WsResult<ParsedFrame> {
    let entries = map
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| WsError::Parse("ticker frame without data array".into()))?;

    let mut updates = Vec::with_capacity(entries.len());
    for entry in entries {
        let symbol = entry.get("symbol").and_then(Value::as_str);
        let last = entry.get("last").and_then(number_or_string);

        match (symbol.and_then(|s| Symbol::parse(s).ok()), last) {
            (Some(symbol), Some(price)) => match PriceUpdate::new(symbol, price, observed_at) {
                Ok(update) => updates.push(update),
                Err(e) => debug!(error = %e, "Skipping ticker entry"),
            },
            _ => debug!(?entry, "Skipping ticker entry without symbol or last price"),
        }
    }

    Ok(ParsedFrame::Prices(updates))
}

/// `[channel_id, {"c": ["price", "volume"], ...}, "ticker", "XBT/USD"]`
fn parse_legacy_array(items: &[Value], observed_at: DateTime<Utc>) -> WsResult<ParsedFrame> {
    let n = items.len();
    if n < 4 || items[n - 2].as_str() != Some(TICKER_CHANNEL) {
        return Ok(ParsedFrame::Ignored);
    }

    let symbol = items[n - 1]
        .as_str()
        .and_then(legacy_symbol)
        .ok_or_else(|| WsError::Parse("legacy ticker without pair".into()))?;

    let price = items[1]
        .get("c")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(number_or_string)
        .ok_or_else(|| WsError::Parse("legacy ticker without close price".into()))?;

    let update =
        PriceUpdate::new(symbol, price, observed_at).map_err(|e| WsError::Parse(e.to_string()))?;
    Ok(ParsedFrame::Prices(vec![update]))
}

fn legacy_symbol(pair: &str) -> Option<Symbol> {
    let normalized = normalize_symbol(pair)?;
    Some(Symbol::from_normalized(from_legacy_pair(&normalized)))
}

fn number_or_string(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
