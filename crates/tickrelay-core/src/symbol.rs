//! Feed symbol normalization.
//!
//! Feeds and settings stores spell the same pair several ways
//! (`btc-usd`, `BTC_USD`, `BTCUSD`, `btc/usd`). Everything downstream of the
//! settings layer works with the normalized `BASE/QUOTE` form.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Quote currencies recognized when splitting a concatenated pair.
/// Longer suffixes first so `BTCUSDT` does not split as `BTCU/SDT`.
const KNOWN_QUOTES: &[&str] = &["USDT", "USDC", "USD", "EUR"];

/// A normalized feed symbol such as `BTC/USD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Normalize and wrap a raw symbol.
    pub fn parse(raw: &str) -> Result<Self> {
        normalize_symbol(raw)
            .map(Self)
            .ok_or_else(|| CoreError::InvalidSymbol(raw.to_string()))
    }

    /// Wrap a symbol that is already in normalized form.
    ///
    /// Callers are responsible for the normalization; this is used on the
    /// hot parse path after the feed has already produced `BASE/QUOTE`.
    pub fn from_normalized(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base currency (the part before `/`).
    pub fn base(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a raw symbol to `BASE/QUOTE`.
///
/// Trims whitespace, upper-cases, and maps `-`, `_` and `:` to `/`.
/// A bare pair with a known quote suffix is split (`BTCUSD` -> `BTC/USD`).
/// Returns `None` for empty input.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let upper: String = trimmed
        .chars()
        .map(|c| match c {
            '-' | '_' | ':' => '/',
            c => c.to_ascii_uppercase(),
        })
        .collect();

    if upper.contains('/') {
        let parts: Vec<&str> = upper.split('/').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            return None;
        }
        return Some(parts.join("/"));
    }

    for quote in KNOWN_QUOTES {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return Some(format!("{base}/{quote}"));
            }
        }
    }

    Some(upper)
}

/// Normalize a collection of raw symbols into a set, dropping empties.
pub fn normalize_symbols<I, S>(raw: I) -> BTreeSet<Symbol>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter_map(|s| normalize_symbol(s.as_ref()))
        .map(Symbol)
        .collect()
}
