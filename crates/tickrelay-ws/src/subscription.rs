//! Symbol subscription tracking.
//!
//! The tracker remembers which symbols the feed currently has subscribed and
//! turns a new desired set into the minimal unsubscribe/subscribe delta.
//! Resubscribing the whole set on every change causes message storms on
//! large watch lists; only the difference is ever sent.

use std::collections::BTreeSet;
use tickrelay_core::{normalize_symbols, Symbol};
use tracing::debug;

/// Symbols to subscribe and unsubscribe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDelta {
    pub to_add: BTreeSet<Symbol>,
    pub to_remove: BTreeSet<Symbol>,
}

impl SubscriptionDelta {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Set difference between two already-normalized symbol sets.
pub fn diff_sets(previous: &BTreeSet<Symbol>, current: &BTreeSet<Symbol>) -> SubscriptionDelta {
    SubscriptionDelta {
        to_add: current.difference(previous).cloned().collect(),
        to_remove: previous.difference(current).cloned().collect(),
    }
}

/// Normalize both raw symbol lists, then diff them.
///
/// Different spellings of the same pair (`btc-usd`, `BTC/USD`) compare equal.
pub fn diff<P, C, S, T>(previous: P, current: C) -> SubscriptionDelta
where
    P: IntoIterator<Item = S>,
    C: IntoIterator<Item = T>,
    S: AsRef<str>,
    T: AsRef<str>,
{
    diff_sets(&normalize_symbols(previous), &normalize_symbols(current))
}

/// Tracks the subscribed set for one feed connection.
#[derive(Debug, Default)]
pub struct SymbolSubscriptionTracker {
    subscribed: BTreeSet<Symbol>,
    acked: BTreeSet<Symbol>,
}

impl SymbolSubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently subscribed symbols.
    pub fn current(&self) -> &BTreeSet<Symbol> {
        &self.subscribed
    }

    /// Delta needed to move from the current set to `desired`.
    pub fn plan(&self, desired: &BTreeSet<Symbol>) -> SubscriptionDelta {
        diff_sets(&self.subscribed, desired)
    }

    /// Record that a delta has been sent.
    pub fn apply(&mut self, delta: &SubscriptionDelta) {
        for symbol in &delta.to_remove {
            self.subscribed.remove(symbol);
            self.acked.remove(symbol);
        }
        self.subscribed.extend(delta.to_add.iter().cloned());
        debug!(
            added = delta.to_add.len(),
            removed = delta.to_remove.len(),
            total = self.subscribed.len(),
            "Subscription set updated"
        );
    }

    /// Replace the set wholesale (initial subscribe on a fresh connection).
    pub fn replace(&mut self, symbols: BTreeSet<Symbol>) {
        self.subscribed = symbols;
        self.acked.clear();
    }

    /// Mark a symbol as confirmed by the feed.
    pub fn mark_acked(&mut self, symbol: &Symbol) {
        if self.subscribed.contains(symbol) {
            self.acked.insert(symbol.clone());
        }
    }

    /// Drop a symbol the feed refused, so the next update retries it.
    pub fn forget(&mut self, symbol: &Symbol) {
        self.subscribed.remove(symbol);
        self.acked.remove(symbol);
    }

    pub fn acked_count(&self) -> usize {
        self.acked.len()
    }

    /// Forget everything (transport closed: the server dropped our subscriptions).
    pub fn reset(&mut self) {
        self.subscribed.clear();
        self.acked.clear();
    }
}
