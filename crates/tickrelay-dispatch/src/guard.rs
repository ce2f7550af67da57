//! DispatchGuard: backpressure in front of the downstream persistence service.
//!
//! Two independent failure trackers:
//! - `CircuitBreaker` + `BackoffWindow`: seconds-scale request throttling
//! - `DegradedServiceState`: minutes-scale service outage, ending in a pause
//!   that only elapses or a manual override lifts
//!
//! All state lives behind one mutex that is never held across the
//! downstream `.await`.

use crate::breaker::{BackoffWindow, CircuitBreaker};
use crate::client::{DownstreamResponse, PersistenceClient};
use crate::degraded::DegradedServiceState;
use crate::error::{DispatchError, DispatchResult};
use crate::policy::{decide, Decision, GuardSnapshot, SkipReason};
use crate::store::{GuardStateStore, MemoryStateStore};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tickrelay_core::{PriceUpdate, Symbol};
use tickrelay_telemetry::{Metrics, ObservabilityEvent, SharedSink};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const EVENT_SOURCE: &str = "dispatch";

// ============================================================================
// GuardConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    /// Consecutive failures that open the breaker.
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    /// Backoff used when downstream gives no retry hint.
    pub default_backoff: Duration,
    /// Degraded attempts before pausing. 0 disables pausing.
    pub max_database_retries: u32,
    pub pause_duration: Duration,
    /// Upper bound on entries per downstream call, held entries included.
    pub max_dispatch_size: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
            default_backoff: Duration::from_secs(5),
            max_database_retries: 3,
            pause_duration: Duration::from_secs(30 * 60),
            max_dispatch_size: 500,
        }
    }
}

// ============================================================================
// Outcome / status
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered {
        /// Entries downstream reports as processed.
        processed: usize,
        /// Downstream accepted the batch but flagged itself degraded.
        degraded: bool,
    },
    Skipped(SkipReason),
}

/// Read-only view of the guard for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardStatus {
    pub consecutive_failures: u32,
    pub circuit_open: bool,
    pub backoff_remaining: Duration,
    /// Pause in effect at the wall-clock time of the call.
    pub paused: bool,
    pub degraded: DegradedServiceState,
    /// Entries waiting for the next successful dispatch.
    pub undelivered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    Throttled,
    Unavailable,
    Hard,
}

struct GuardState {
    breaker: CircuitBreaker,
    backoff: BackoffWindow,
    degraded: DegradedServiceState,
    /// Monotonic deadline mirroring `degraded.resume_at`.
    paused_until: Option<Instant>,
    undelivered: HashMap<Symbol, PriceUpdate>,
    last_skip: Option<SkipReason>,
    /// Set by a hard failure; the next call that proceeds sends half.
    split_next: bool,
}

impl GuardState {
    fn snapshot(&self) -> GuardSnapshot {
        GuardSnapshot {
            paused_until: if self.degraded.paused {
                self.paused_until
            } else {
                None
            },
            backoff_until: self.backoff.active_until(),
            breaker_open_until: self.breaker.open_until(),
        }
    }

    /// Keep the newest entry per symbol.
    fn retain(&mut self, updates: &[PriceUpdate]) {
        for update in updates {
            self.hold(update.clone());
        }
    }

    fn hold(&mut self, update: PriceUpdate) {
        let newer = self
            .undelivered
            .get(update.symbol())
            .map_or(true, |held| held.observed_at() <= update.observed_at());
        if newer {
            self.undelivered.insert(update.symbol().clone(), update);
        }
    }

    /// Drop held entries that a delivered payload already covers.
    fn forget_delivered(&mut self, delivered: &[PriceUpdate]) {
        for update in delivered {
            if matches!(
                self.undelivered.get(update.symbol()),
                Some(held) if held.observed_at() <= update.observed_at()
            ) {
                self.undelivered.remove(update.symbol());
            }
        }
    }

    /// Build the next payload: `batch` first, then held entries oldest
    /// first, at most `max` in total and half that after a hard failure.
    /// Whatever does not fit stays held.
    fn take_payload(&mut self, batch: &[PriceUpdate], max: usize) -> Vec<PriceUpdate> {
        let mut payload = Vec::with_capacity(batch.len() + self.undelivered.len());
        for update in batch {
            let newest = match self.undelivered.remove(update.symbol()) {
                Some(held) if held.observed_at() > update.observed_at() => held,
                _ => update.clone(),
            };
            payload.push(newest);
        }
        let mut held: Vec<PriceUpdate> = self.undelivered.drain().map(|(_, u)| u).collect();
        held.sort_by_key(PriceUpdate::observed_at);
        payload.extend(held);

        let mut limit = max.max(1).min(payload.len());
        if std::mem::take(&mut self.split_next) && limit >= 2 {
            limit = (limit + 1) / 2;
            warn!(
                size = payload.len(),
                sending = limit,
                "Previous dispatch hard-failed, sending halved batch"
            );
        }
        for update in payload.drain(limit..) {
            self.hold(update);
        }
        payload
    }
}

// ============================================================================
// DispatchGuard
// ============================================================================

pub struct DispatchGuard {
    config: GuardConfig,
    client: Arc<dyn PersistenceClient>,
    sink: SharedSink,
    store: Arc<dyn GuardStateStore>,
    state: Mutex<GuardState>,
}

impl DispatchGuard {
    pub fn new(config: GuardConfig, client: Arc<dyn PersistenceClient>, sink: SharedSink) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown);
        Self {
            config,
            client,
            sink,
            store: Arc::new(MemoryStateStore::new()),
            state: Mutex::new(GuardState {
                breaker,
                backoff: BackoffWindow::default(),
                degraded: DegradedServiceState::default(),
                paused_until: None,
                undelivered: HashMap::new(),
                last_skip: None,
                split_next: false,
            }),
        }
    }

    /// Use `store` for the degraded state and restore whatever it holds.
    ///
    /// A saved pause whose `resume_at` is still ahead continues for the
    /// remaining wall-clock time. One that elapsed while we were down is
    /// cleared on load.
    pub fn with_store(mut self, store: Arc<dyn GuardStateStore>) -> DispatchResult<Self> {
        if let Some(mut saved) = store.load()? {
            let now = Utc::now();
            if saved.paused && !saved.is_paused_at(now) {
                info!(resume_at = ?saved.resume_at, "Saved pause already elapsed, resuming");
                saved.resume();
                store.save(&saved)?;
            }
            let mut state = self.state.lock();
            if saved.paused {
                let remaining = match saved.resume_at {
                    Some(at) => (at - now).to_std().unwrap_or_default(),
                    None => self.config.pause_duration,
                };
                state.paused_until = Some(Instant::now() + remaining);
                Metrics::paused(true);
                warn!(
                    resume_at = ?saved.resume_at,
                    attempts = saved.connection_attempts,
                    "Restored paused downstream state"
                );
            }
            state.degraded = saved;
        }
        self.store = store;
        Ok(self)
    }

    #[must_use]
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    #[must_use]
    pub fn status(&self) -> GuardStatus {
        let now = Instant::now();
        let state = self.state.lock();
        GuardStatus {
            consecutive_failures: state.breaker.consecutive_failures(),
            circuit_open: state.breaker.is_open(now),
            backoff_remaining: state.backoff.remaining(now),
            paused: state.degraded.is_paused_at(Utc::now()),
            degraded: state.degraded.clone(),
            undelivered: state.undelivered.len(),
        }
    }

    /// Send `batch` downstream unless policy says to wait.
    ///
    /// Skips are `Ok(Skipped(_))` and keep the batch for later. Downstream
    /// failures update guard state and come back as `Err`.
    pub async fn dispatch(&self, batch: &[PriceUpdate]) -> DispatchResult<DispatchOutcome> {
        if batch.is_empty() {
            Metrics::dispatch_outcome("skipped_empty_batch");
            return Ok(DispatchOutcome::Skipped(SkipReason::EmptyBatch));
        }

        let payload = {
            let now = Instant::now();
            let mut state = self.state.lock();
            self.resume_if_due(&mut state, now);

            if let Decision::Skip(reason) = decide(&state.snapshot(), now) {
                state.retain(batch);
                self.note_skip(&mut state, reason, now);
                return Ok(DispatchOutcome::Skipped(reason));
            }
            state.last_skip = None;

            // Entries held back from earlier attempts ride along unless the
            // new batch carries a fresher value for the same symbol.
            state.take_payload(batch, self.config.max_dispatch_size)
        };

        self.attempt(payload).await
    }

    /// Reset every tracker and retry the last undelivered batch once,
    /// ignoring cooldowns. Calling it again with nothing left is a no-op.
    pub async fn manual_override(&self) -> DispatchResult<DispatchOutcome> {
        let payload = {
            let mut state = self.state.lock();
            state.breaker.reset();
            state.backoff.clear();
            state.degraded.reset();
            state.paused_until = None;
            state.last_skip = None;
            state.split_next = false;
            self.persist(&state.degraded);
            state.take_payload(&[], self.config.max_dispatch_size)
        };
        Metrics::circuit_open(false);
        Metrics::paused(false);

        info!(retrying = payload.len(), "Manual override: guard state reset");
        self.sink.emit(
            ObservabilityEvent::info(EVENT_SOURCE, "Manual override: dispatch resumed")
                .with_detail("retrying", payload.len()),
        );

        if payload.is_empty() {
            return Ok(DispatchOutcome::Skipped(SkipReason::EmptyBatch));
        }
        self.attempt(payload).await
    }

    async fn attempt(&self, payload: Vec<PriceUpdate>) -> DispatchResult<DispatchOutcome> {
        let result = self.send(&payload).await;
        self.settle(&payload, result)
    }

    async fn send(&self, payload: &[PriceUpdate]) -> DispatchResult<DownstreamResponse> {
        let started = Instant::now();
        let result = self.client.send(payload).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        Metrics::downstream_latency(latency_ms);
        debug!(size = payload.len(), latency_ms, ok = result.is_ok(), "Downstream call");
        result
    }

    /// Fold one downstream result into guard state.
    fn settle(
        &self,
        payload: &[PriceUpdate],
        result: DispatchResult<DownstreamResponse>,
    ) -> DispatchResult<DispatchOutcome> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.record_failure(&mut state, payload, FailureClass::Hard, None, &e, now);
                return Err(e);
            }
        };

        if response.is_success() {
            return Ok(self.record_success(&mut state, payload, &response));
        }

        let (class, err) = match response.status {
            429 => (
                FailureClass::Throttled,
                DispatchError::Throttled {
                    status: response.status,
                    retry_after: response.retry_after,
                },
            ),
            503 => (
                FailureClass::Unavailable,
                DispatchError::Unavailable {
                    status: response.status,
                    retry_after: response.retry_after,
                    code: response.code.clone(),
                },
            ),
            status => (
                FailureClass::Hard,
                DispatchError::HardFailure {
                    status,
                    message: response.message.clone().unwrap_or_default(),
                },
            ),
        };
        self.record_failure(&mut state, payload, class, response.retry_after, &err, now);
        Err(err)
    }

    fn record_success(
        &self,
        state: &mut GuardState,
        payload: &[PriceUpdate],
        response: &DownstreamResponse,
    ) -> DispatchOutcome {
        let was_open = state.breaker.open_until().is_some();
        state.breaker.record_success();
        state.backoff.clear();
        state.forget_delivered(payload);
        if state.degraded.connection_attempts > 0 {
            state.degraded.connection_attempts = 0;
            self.persist(&state.degraded);
        }
        if was_open {
            Metrics::circuit_open(false);
        }

        let processed = response.processed_count.unwrap_or(payload.len());
        let event = if response.degraded {
            Metrics::dispatch_outcome("delivered_degraded");
            warn!(processed, "Downstream accepted batch but reports degraded service");
            ObservabilityEvent::warning(EVENT_SOURCE, "Batch delivered, downstream degraded")
        } else {
            Metrics::dispatch_outcome("delivered");
            debug!(processed, "Batch delivered");
            ObservabilityEvent::success(EVENT_SOURCE, "Batch delivered")
        };
        self.sink.emit(
            event
                .with_detail("size", payload.len())
                .with_detail("processed", processed),
        );

        DispatchOutcome::Delivered {
            processed,
            degraded: response.degraded,
        }
    }

    fn record_failure(
        &self,
        state: &mut GuardState,
        payload: &[PriceUpdate],
        class: FailureClass,
        retry_after: Option<Duration>,
        err: &DispatchError,
        now: Instant,
    ) {
        state.retain(payload);

        let opened = state.breaker.record_failure(now);
        let backoff = match class {
            FailureClass::Throttled | FailureClass::Unavailable => {
                retry_after.unwrap_or(self.config.default_backoff)
            }
            FailureClass::Hard => self.config.default_backoff,
        };
        state.backoff.set(now, backoff);

        if class == FailureClass::Hard && payload.len() >= 2 && !state.breaker.is_open(now) {
            state.split_next = true;
        }
        if opened {
            Metrics::circuit_open(true);
        }
        Metrics::dispatch_outcome(err.kind());

        warn!(
            error = %err,
            failures = state.breaker.consecutive_failures(),
            backoff_ms = backoff.as_millis() as u64,
            circuit_opened = opened,
            split_next = state.split_next,
            "Dispatch failed"
        );
        self.sink.emit(
            ObservabilityEvent::warning(EVENT_SOURCE, format!("Dispatch failed: {err}"))
                .with_detail("kind", err.kind())
                .with_detail("failures", state.breaker.consecutive_failures())
                .with_detail("backoff_ms", backoff.as_millis() as u64)
                .with_detail("circuit_opened", opened),
        );

        let counts_as_outage = class == FailureClass::Unavailable
            || (class == FailureClass::Throttled && opened);
        if !counts_as_outage {
            state.degraded.last_error = err.to_string();
            return;
        }

        let attempts = state.degraded.record_attempt(err.to_string());
        let limit = self.config.max_database_retries;
        if limit > 0 && attempts >= limit && !state.degraded.paused {
            self.pause(state, now);
        }
        self.persist(&state.degraded);
    }

    fn pause(&self, state: &mut GuardState, now: Instant) {
        let resume_at = Utc::now()
            + chrono::Duration::from_std(self.config.pause_duration)
                .unwrap_or_else(|_| chrono::Duration::minutes(30));
        state.degraded.pause(resume_at);
        state.paused_until = Some(now + self.config.pause_duration);
        Metrics::paused(true);

        error!(
            attempts = state.degraded.connection_attempts,
            resume_at = %resume_at,
            last_error = %state.degraded.last_error,
            "Downstream unavailable, dispatch paused"
        );
        self.sink.emit(
            ObservabilityEvent::error(
                EVENT_SOURCE,
                "Downstream service unavailable, dispatch paused until manual override or resume time",
            )
            .with_detail("attempts", state.degraded.connection_attempts)
            .with_detail("resume_at", resume_at.to_rfc3339())
            .with_detail("last_error", state.degraded.last_error.clone()),
        );
    }

    fn resume_if_due(&self, state: &mut GuardState, now: Instant) {
        if !state.degraded.paused {
            return;
        }
        if matches!(state.paused_until, Some(until) if now < until) {
            return;
        }
        state.degraded.resume();
        state.paused_until = None;
        self.persist(&state.degraded);
        Metrics::paused(false);

        info!(
            attempts = state.degraded.connection_attempts,
            "Pause elapsed, resuming dispatch"
        );
        self.sink.emit(ObservabilityEvent::info(
            EVENT_SOURCE,
            "Pause elapsed, resuming dispatch",
        ));
    }

    /// Debug-log every skip; emit an event only when the reason changes.
    fn note_skip(&self, state: &mut GuardState, reason: SkipReason, now: Instant) {
        Metrics::dispatch_outcome(match reason {
            SkipReason::Degraded => "skipped_degraded",
            SkipReason::Backoff => "skipped_backoff",
            SkipReason::CircuitOpen => "skipped_circuit_open",
            SkipReason::EmptyBatch => "skipped_empty_batch",
        });
        debug!(reason = %reason, held = state.undelivered.len(), "Dispatch skipped");

        if state.last_skip == Some(reason) {
            return;
        }
        state.last_skip = Some(reason);

        let wait = match reason {
            SkipReason::Degraded => state
                .paused_until
                .map(|u| u.saturating_duration_since(now))
                .unwrap_or_default(),
            SkipReason::Backoff => state.backoff.remaining(now),
            SkipReason::CircuitOpen => state
                .breaker
                .open_until()
                .map(|u| u.saturating_duration_since(now))
                .unwrap_or_default(),
            SkipReason::EmptyBatch => Duration::ZERO,
        };
        self.sink.emit(
            ObservabilityEvent::info(EVENT_SOURCE, format!("Dispatch skipped: {reason}"))
                .with_detail("reason", reason.as_str())
                .with_detail("wait_ms", wait.as_millis() as u64),
        );
    }

    fn persist(&self, degraded: &DegradedServiceState) {
        if let Err(e) = self.store.save(degraded) {
            warn!(error = %e, "Failed to save guard state");
        }
    }
}
