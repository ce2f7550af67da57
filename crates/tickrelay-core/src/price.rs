//! Price update value type.

use crate::error::{CoreError, Result};
use crate::symbol::Symbol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single price observation for one symbol.
///
/// Immutable once built. The price is always finite and strictly positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    symbol: Symbol,
    price: f64,
    observed_at: DateTime<Utc>,
}

impl PriceUpdate {
    /// Create a new update, rejecting non-positive or non-finite prices.
    pub fn new(symbol: Symbol, price: f64, observed_at: DateTime<Utc>) -> Result<Self> {
        if !price.is_finite() || price <= 0.0 {
            return Err(CoreError::InvalidPrice {
                symbol: symbol.to_string(),
                price,
            });
        }
        Ok(Self {
            symbol,
            price,
            observed_at,
        })
    }

    /// Create an update observed now.
    pub fn now(symbol: Symbol, price: f64) -> Result<Self> {
        Self::new(symbol, price, Utc::now())
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}
