//! Main application orchestration.
//!
//! Wires the pipeline:
//! - FeedConnector -> feed pump -> DualLaneBatcher
//! - lane flush timers -> ChannelFlushSink -> dispatcher -> DispatchGuard
//! - every component -> shared observability sink

use crate::config::AppConfig;
use crate::error::AppResult;
use std::sync::Arc;
use std::time::Duration;
use tickrelay_batch::{
    BatchStats, ChannelFlushSink, DualLaneBatcher, Lane, LaneBatch, LaneRouter, UpdateBatcher,
};
use tickrelay_core::normalize_symbols;
use tickrelay_dispatch::{
    DispatchGuard, DispatchOutcome, GuardStatus, HttpPersistenceClient, JsonFileStateStore,
    PersistenceClient,
};
use tickrelay_telemetry::{
    BroadcastSink, FanoutSink, Metrics, ObservabilityEvent, SharedSink, TracingSink,
};
use tickrelay_ws::{ConnectionConfig, ConnectorSnapshot, FeedConnector, FeedEvent};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Main application.
pub struct Application {
    config: AppConfig,
    broadcast: BroadcastSink,
    sink: SharedSink,
    client: Option<Arc<dyn PersistenceClient>>,
}

impl Application {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        let broadcast = BroadcastSink::new(config.telemetry.event_buffer);
        let sink: SharedSink = Arc::new(
            FanoutSink::new()
                .with(Arc::new(TracingSink))
                .with(Arc::new(broadcast.clone())),
        );

        Ok(Self {
            config,
            broadcast,
            sink,
            client: None,
        })
    }

    /// Also deliver observability events to `sink`.
    pub fn with_event_sink(mut self, sink: SharedSink) -> Self {
        self.sink = Arc::new(FanoutSink::new().with(self.sink).with(sink));
        self
    }

    /// Replace the HTTP persistence client.
    pub fn with_client(mut self, client: Arc<dyn PersistenceClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Subscribe to observability events (for a UI).
    pub fn events(&self) -> broadcast::Receiver<ObservabilityEvent> {
        self.broadcast.subscribe()
    }

    /// Spawn every task and connect the feed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> AppResult<RunningApp> {
        let config = self.config;
        let sink = self.sink;

        // Dispatch
        let client: Arc<dyn PersistenceClient> = match self.client {
            Some(client) => client,
            None => Arc::new(HttpPersistenceClient::new(
                config.dispatch.http_config(config.feed.compression_enabled),
            )?),
        };
        let mut guard = DispatchGuard::new(config.dispatch.guard_config(), client, sink.clone());
        if let Some(path) = &config.dispatch.state_file {
            guard = guard.with_store(Arc::new(JsonFileStateStore::new(path)))?;
        }
        let guard = Arc::new(guard);

        // Batching
        let (flush_sink, batch_rx) = ChannelFlushSink::channel(config.batch.dispatch_queue);
        let flush_sink = Arc::new(flush_sink);
        let primary = Arc::new(UpdateBatcher::new(
            Lane::Primary,
            config.batch.primary(),
            flush_sink.clone(),
        )?);
        let secondary = Arc::new(UpdateBatcher::new(
            Lane::Secondary,
            config.batch.secondary(),
            flush_sink,
        )?);
        let router = LaneRouter::new(normalize_symbols(&config.symbols.priority));
        let lanes = Arc::new(DualLaneBatcher::new(router, primary, secondary));

        let batch_cancel = CancellationToken::new();
        let batch_tasks = lanes.spawn(&batch_cancel);

        let dispatch_cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(run_dispatcher(
            guard.clone(),
            batch_rx,
            dispatch_cancel.clone(),
        ));

        // Feed
        let conn_config = ConnectionConfig::from(&config.feed);
        let (connector, feed_rx, feed_driver) = FeedConnector::spawn(conn_config, sink.clone());
        let pump = tokio::spawn(run_feed_pump(feed_rx, lanes.clone()));

        info!(
            url = %config.feed.url,
            watched = config.symbols.watched.len(),
            priority = config.symbols.priority.len(),
            endpoint = %config.dispatch.endpoint,
            "Pipeline started"
        );
        connector.connect(&config.symbols.watched)?;

        Ok(RunningApp {
            control: ControlHandle {
                connector,
                guard,
                lanes,
            },
            sink,
            status_interval: Duration::from_secs(config.telemetry.status_interval_secs.max(1)),
            batch_cancel,
            batch_tasks,
            dispatch_cancel,
            dispatcher,
            feed_driver,
            pump,
        })
    }

    /// Run until Ctrl-C. On unix, SIGUSR1 triggers a manual reconnect.
    pub async fn run(self) -> AppResult<()> {
        let running = self.start()?;
        let control = running.control();
        let mut status_interval = tokio::time::interval(running.status_interval);
        let reconnect_cancel = CancellationToken::new();
        let reconnect_task = spawn_reconnect_signal(control.clone(), reconnect_cancel.clone())?;

        loop {
            tokio::select! {
                _ = status_interval.tick() => {
                    let status = control.status();
                    info!(
                        feed_state = %status.feed.state(),
                        reconnect_attempt = status.feed.attempt,
                        max_attempts = status.feed.max_attempts,
                        subscribed = status.feed.subscribed.len(),
                        acked = status.feed.acked,
                        last_rtt_ms = ?status.feed.keepalive.last_rtt_ms,
                        primary_pending = control.lanes().lane(Lane::Primary).pending_count(),
                        secondary_pending = control.lanes().lane(Lane::Secondary).pending_count(),
                        primary_flushed = status.primary.total_flushed,
                        secondary_flushed = status.secondary.total_flushed,
                        failures = status.guard.consecutive_failures,
                        circuit_open = status.guard.circuit_open,
                        paused = status.guard.paused,
                        undelivered = status.guard.undelivered,
                        "Status"
                    );
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        reconnect_cancel.cancel();
        if let Some(task) = reconnect_task {
            let _ = task.await;
        }
        running.shutdown().await
    }
}

#[cfg(unix)]
fn spawn_reconnect_signal(
    control: ControlHandle,
    cancel: CancellationToken,
) -> AppResult<Option<JoinHandle<()>>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    Ok(Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = usr1.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("SIGUSR1 received, manual reconnect");
                    if let Err(e) = control.manual_reconnect().await {
                        warn!(error = %e, "Manual reconnect failed");
                    }
                }
            }
        }
    })))
}

#[cfg(not(unix))]
fn spawn_reconnect_signal(
    _control: ControlHandle,
    _cancel: CancellationToken,
) -> AppResult<Option<JoinHandle<()>>> {
    Ok(None)
}

// ============================================================================
// Running pipeline
// ============================================================================

/// Point-in-time status across the pipeline.
#[derive(Debug, Clone)]
pub struct AppStatus {
    pub feed: ConnectorSnapshot,
    pub primary: BatchStats,
    pub secondary: BatchStats,
    pub guard: GuardStatus,
}

/// User-facing controls. Cheap to clone.
#[derive(Clone)]
pub struct ControlHandle {
    connector: FeedConnector,
    guard: Arc<DispatchGuard>,
    lanes: Arc<DualLaneBatcher>,
}

impl ControlHandle {
    pub fn connector(&self) -> &FeedConnector {
        &self.connector
    }

    pub fn guard(&self) -> &Arc<DispatchGuard> {
        &self.guard
    }

    pub fn lanes(&self) -> &Arc<DualLaneBatcher> {
        &self.lanes
    }

    /// Reconnect the feed and override the dispatch guard, ignoring every
    /// cooldown. Safe to call while a reconnect is already in progress.
    pub async fn manual_reconnect(&self) -> AppResult<DispatchOutcome> {
        self.connector.reconnect()?;
        Ok(self.guard.manual_override().await?)
    }

    /// Replace the watched set (delta-subscribed) and the priority set.
    pub fn update_symbols(&self, watched: &[String], priority: &[String]) -> AppResult<()> {
        self.connector.update_symbols(watched)?;
        let moved = self.lanes.reclassify(normalize_symbols(priority));
        debug!(moved, "Symbols updated");
        Ok(())
    }

    pub fn status(&self) -> AppStatus {
        let (primary, secondary) = self.lanes.stats();
        AppStatus {
            feed: self.connector.snapshot(),
            primary,
            secondary,
            guard: self.guard.status(),
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn metrics_text(&self) -> AppResult<String> {
        Ok(Metrics::render()?)
    }
}

/// Handles to a started pipeline.
pub struct RunningApp {
    control: ControlHandle,
    sink: SharedSink,
    status_interval: Duration,
    batch_cancel: CancellationToken,
    batch_tasks: Vec<JoinHandle<()>>,
    dispatch_cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    feed_driver: JoinHandle<()>,
    pump: JoinHandle<()>,
}

impl RunningApp {
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Stop the feed, drain both lanes through the dispatcher, then return.
    pub async fn shutdown(self) -> AppResult<()> {
        info!("Shutting down pipeline");
        self.control.connector.shutdown();
        if let Err(e) = self.feed_driver.await {
            error!(error = %e, "Feed driver task failed");
        }
        if let Err(e) = self.pump.await {
            error!(error = %e, "Feed pump task failed");
        }

        // Batchers drain into the channel, then the dispatcher drains it.
        self.batch_cancel.cancel();
        for task in self.batch_tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Batcher task failed");
            }
        }
        self.dispatch_cancel.cancel();
        if let Err(e) = self.dispatcher.await {
            error!(error = %e, "Dispatcher task failed");
        }

        let status = self.control.status();
        info!(
            primary_flushed = status.primary.total_flushed,
            secondary_flushed = status.secondary.total_flushed,
            undelivered = status.guard.undelivered,
            "Shutdown complete"
        );
        match self.control.metrics_text() {
            Ok(text) => debug!(metrics = %text, "Final metrics"),
            Err(e) => warn!(error = %e, "Failed to render metrics"),
        }
        self.sink
            .emit(ObservabilityEvent::info("app", "Pipeline stopped"));
        Ok(())
    }
}

/// Route parsed prices into the lanes until the connector stops.
async fn run_feed_pump(mut feed_rx: mpsc::Receiver<FeedEvent>, lanes: Arc<DualLaneBatcher>) {
    while let Some(event) = feed_rx.recv().await {
        match event {
            FeedEvent::Prices(prices) => lanes.route_many(prices),
            FeedEvent::Status { state, error } => {
                debug!(state = %state, error = ?error, "Feed status");
            }
        }
    }
    debug!("Feed pump stopped");
}

/// Hand flushed batches to the guard, one at a time in flush order.
async fn run_dispatcher(
    guard: Arc<DispatchGuard>,
    mut batch_rx: mpsc::Receiver<LaneBatch>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            batch = batch_rx.recv() => match batch {
                Some(batch) => dispatch_one(&guard, batch).await,
                None => return,
            },
        }
    }

    let mut drained = 0;
    while let Ok(batch) = batch_rx.try_recv() {
        dispatch_one(&guard, batch).await;
        drained += 1;
    }
    debug!(drained, "Dispatcher stopped");
}

async fn dispatch_one(guard: &DispatchGuard, batch: LaneBatch) {
    match guard.dispatch(&batch.updates).await {
        Ok(DispatchOutcome::Delivered {
            processed,
            degraded,
        }) => {
            debug!(
                lane = batch.lane.as_str(),
                size = batch.updates.len(),
                processed,
                degraded,
                "Batch dispatched"
            );
        }
        Ok(DispatchOutcome::Skipped(reason)) => {
            debug!(lane = batch.lane.as_str(), reason = %reason, "Batch held");
        }
        Err(e) => {
            debug!(lane = batch.lane.as_str(), error = %e, "Batch dispatch failed");
        }
    }
}
