//! Priority lanes.
//!
//! Latency-sensitive symbols go through the `Primary` lane (short interval);
//! everything else goes through `Secondary` (longer interval, bigger batches)
//! to keep load off the downstream service. Which symbols are priority is
//! caller policy and can change at runtime.

use crate::batcher::UpdateBatcher;
use crate::stats::BatchStats;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tickrelay_core::{PriceUpdate, Symbol};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Primary,
    Secondary,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies symbols into lanes.
#[derive(Debug, Default)]
pub struct LaneRouter {
    priority: RwLock<BTreeSet<Symbol>>,
}

impl LaneRouter {
    pub fn new(priority: BTreeSet<Symbol>) -> Self {
        Self {
            priority: RwLock::new(priority),
        }
    }

    pub fn lane_for(&self, symbol: &Symbol) -> Lane {
        if self.priority.read().contains(symbol) {
            Lane::Primary
        } else {
            Lane::Secondary
        }
    }

    pub fn priority(&self) -> BTreeSet<Symbol> {
        self.priority.read().clone()
    }

    /// Replace the priority set. Returns `(promoted, demoted)`.
    pub fn set_priority(&self, priority: BTreeSet<Symbol>) -> (Vec<Symbol>, Vec<Symbol>) {
        let mut current = self.priority.write();
        let promoted = priority.difference(&current).cloned().collect();
        let demoted = current.difference(&priority).cloned().collect();
        *current = priority;
        (promoted, demoted)
    }
}

/// Two independent batchers plus the router between them.
pub struct DualLaneBatcher {
    router: LaneRouter,
    primary: Arc<UpdateBatcher>,
    secondary: Arc<UpdateBatcher>,
}

impl DualLaneBatcher {
    pub fn new(router: LaneRouter, primary: Arc<UpdateBatcher>, secondary: Arc<UpdateBatcher>) -> Self {
        Self {
            router,
            primary,
            secondary,
        }
    }

    pub fn lane(&self, lane: Lane) -> &Arc<UpdateBatcher> {
        match lane {
            Lane::Primary => &self.primary,
            Lane::Secondary => &self.secondary,
        }
    }

    pub fn router(&self) -> &LaneRouter {
        &self.router
    }

    /// Enqueue into whichever lane the symbol currently belongs to.
    pub fn route(&self, update: PriceUpdate) -> Lane {
        let lane = self.router.lane_for(update.symbol());
        self.lane(lane).enqueue(update);
        lane
    }

    pub fn route_many<I>(&self, updates: I)
    where
        I: IntoIterator<Item = PriceUpdate>,
    {
        let (primary, secondary): (Vec<_>, Vec<_>) = updates
            .into_iter()
            .partition(|u| self.router.lane_for(u.symbol()) == Lane::Primary);
        if !primary.is_empty() {
            self.primary.enqueue_many(primary);
        }
        if !secondary.is_empty() {
            self.secondary.enqueue_many(secondary);
        }
    }

    /// Re-evaluate routing after the priority classification changed.
    ///
    /// Pending updates for reclassified symbols move to their new lane so the
    /// next flush of that lane carries them. Returns how many moved.
    pub fn reclassify(&self, priority: BTreeSet<Symbol>) -> usize {
        let (promoted, demoted) = self.router.set_priority(priority);
        let moved = self.move_pending(&promoted, &demoted);

        info!(
            promoted = promoted.len(),
            demoted = demoted.len(),
            moved,
            "Lane classification updated"
        );
        moved
    }

    /// Routing already points at the new lane, so a value routed there
    /// since `set_priority` may be fresher than the one being moved.
    fn move_pending(&self, promoted: &[Symbol], demoted: &[Symbol]) -> usize {
        let mut moved = 0;
        for symbol in promoted {
            if let Some(update) = self.secondary.take_symbol(symbol) {
                self.primary.adopt(update);
                moved += 1;
            }
        }
        for symbol in demoted {
            if let Some(update) = self.primary.take_symbol(symbol) {
                self.secondary.adopt(update);
                moved += 1;
            }
        }
        moved
    }

    pub fn pending_count(&self) -> usize {
        self.primary.pending_count() + self.secondary.pending_count()
    }

    pub fn stats(&self) -> (BatchStats, BatchStats) {
        (self.primary.stats(), self.secondary.stats())
    }

    /// Spawn both flush timers.
    pub fn spawn(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.primary.clone().run(cancel.child_token())),
            tokio::spawn(self.secondary.clone().run(cancel.child_token())),
        ]
    }
}
