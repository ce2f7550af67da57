//! Core domain types for the tickrelay price pipeline.
//!
//! This crate provides the values shared by every stage:
//! - `PriceUpdate`: a single observed price for one symbol
//! - `Symbol`: a feed symbol in normalized `BASE/QUOTE` form
//! - `normalize_symbol`: case and separator normalization

pub mod error;
pub mod price;
pub mod symbol;

pub use error::{CoreError, Result};
pub use price::PriceUpdate;
pub use symbol::{normalize_symbol, normalize_symbols, Symbol};
