//! Outbound feed requests.

use serde::Serialize;
use tickrelay_core::Symbol;

/// Ticker channel name on the feed.
pub const TICKER_CHANNEL: &str = "ticker";

/// Subscription method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMethod {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Subscription parameters.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionParams {
    pub channel: String,
    pub symbol: Vec<String>,
}

/// Subscribe/unsubscribe request.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    pub method: SubscriptionMethod,
    pub params: SubscriptionParams,
}

impl SubscriptionRequest {
    pub fn new<'a, I>(method: SubscriptionMethod, channel: &str, symbols: I) -> Self
    where
        I: IntoIterator<Item = &'a Symbol>,
    {
        Self {
            method,
            params: SubscriptionParams {
                channel: channel.to_string(),
                symbol: symbols.into_iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    pub fn subscribe<'a, I>(symbols: I) -> Self
    where
        I: IntoIterator<Item = &'a Symbol>,
    {
        Self::new(SubscriptionMethod::Subscribe, TICKER_CHANNEL, symbols)
    }

    pub fn unsubscribe<'a, I>(symbols: I) -> Self
    where
        I: IntoIterator<Item = &'a Symbol>,
    {
        Self::new(SubscriptionMethod::Unsubscribe, TICKER_CHANNEL, symbols)
    }
}

/// Application-level keepalive request.
#[derive(Debug, Clone, Serialize)]
pub struct PingRequest {
    pub method: &'static str,
}

impl PingRequest {
    pub fn new() -> Self {
        Self { method: "ping" }
    }
}

impl Default for PingRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Legacy-generation subscribe request.
///
/// `{"event":"subscribe","pair":["XBT/USD"],"subscription":{"name":"ticker"}}`
#[derive(Debug, Clone, Serialize)]
pub struct LegacySubscribeRequest {
    pub event: &'static str,
    pub pair: Vec<String>,
    pub subscription: LegacySubscription,
}

#[derive(Debug, Clone, Serialize)]
pub struct LegacySubscription {
    pub name: &'static str,
}

impl LegacySubscribeRequest {
    pub fn ticker<'a, I>(symbols: I) -> Self
    where
        I: IntoIterator<Item = &'a Symbol>,
    {
        Self {
            event: "subscribe",
            pair: symbols.into_iter().map(to_legacy_pair).collect(),
            subscription: LegacySubscription { name: TICKER_CHANNEL },
        }
    }
}

/// Base currency aliases used by the legacy protocol generation.
const LEGACY_ALIASES: &[(&str, &str)] = &[("XBT", "BTC"), ("XDG", "DOGE")];

/// Convert a normalized symbol to the legacy pair spelling (`BTC/USD` -> `XBT/USD`).
pub fn to_legacy_pair(symbol: &Symbol) -> String {
    let s = symbol.as_str();
    match s.split_once('/') {
        Some((base, quote)) => {
            let base = LEGACY_ALIASES
                .iter()
                .find(|(_, modern)| *modern == base)
                .map(|(legacy, _)| *legacy)
                .unwrap_or(base);
            format!("{base}/{quote}")
        }
        None => s.to_string(),
    }
}

/// Convert a legacy pair back to its modern base spelling (`XBT/USD` -> `BTC/USD`).
pub fn from_legacy_pair(pair: &str) -> String {
    match pair.split_once('/') {
        Some((base, quote)) => {
            let base = LEGACY_ALIASES
                .iter()
                .find(|(legacy, _)| *legacy == base)
                .map(|(_, modern)| *modern)
                .unwrap_or(base);
            format!("{base}/{quote}")
        }
        None => pair.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn symbols(raw: &[&str]) -> Vec<Symbol> {
        raw.iter().map(|s| Symbol::parse(s).unwrap()).collect()
    }

    #[test]
    fn test_subscribe_request_shape() {
        let syms = symbols(&["BTC/USD", "ETH/USD"]);
        let req = SubscriptionRequest::subscribe(&syms);
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "method": "subscribe",
                "params": {"channel": "ticker", "symbol": ["BTC/USD", "ETH/USD"]}
            })
        );
    }

    #[test]
    fn test_unsubscribe_request_shape() {
        let syms = symbols(&["SOL/USD"]);
        let req = SubscriptionRequest::unsubscribe(&syms);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["method"], "unsubscribe");
        assert_eq!(value["params"]["symbol"], json!(["SOL/USD"]));
    }

    #[test]
    fn test_ping_request() {
        let value = serde_json::to_value(PingRequest::new()).unwrap();
        assert_eq!(value, json!({"method": "ping"}));
    }

    #[test]
    fn test_legacy_subscribe_uses_legacy_aliases() {
        let syms = symbols(&["BTC/USD", "DOGE/USD", "ETH/EUR"]);
        let req = LegacySubscribeRequest::ticker(&syms);
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "event": "subscribe",
                "pair": ["XBT/USD", "XDG/USD", "ETH/EUR"],
                "subscription": {"name": "ticker"}
            })
        );
    }

    #[test]
    fn test_legacy_pair_round_trip() {
        assert_eq!(from_legacy_pair("XBT/USD"), "BTC/USD");
        assert_eq!(from_legacy_pair("ETH/USD"), "ETH/USD");
        assert_eq!(from_legacy_pair("XBTUSD"), "XBTUSD");
    }
}
