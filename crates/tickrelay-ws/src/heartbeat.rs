//! Keepalive tracking for the feed connection.
//!
//! Sends an application-level ping every `ping_interval` once the connection
//! is live and declares the connection dead if the matching pong does not
//! arrive within `pong_timeout`. Uses `tokio::time::Instant` so paused-clock
//! tests drive it deterministically.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// What the connector should do when the keepalive deadline fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    SendPing,
    TimedOut,
    Idle,
}

/// Keepalive monitor. Owned by the connector driver, so no locking.
#[derive(Debug)]
pub struct KeepaliveMonitor {
    ping_interval: Duration,
    pong_timeout: Duration,
    started: Instant,
    last_ping: Option<Instant>,
    waiting_for_pong: bool,
    last_rtt: Option<Duration>,
    pings_sent: u64,
    pongs_received: u64,
}

impl KeepaliveMonitor {
    pub fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            ping_interval,
            pong_timeout,
            started: now,
            last_ping: None,
            waiting_for_pong: false,
            last_rtt: None,
            pings_sent: 0,
            pongs_received: 0,
        }
    }

    /// Reset timers (called when the connection becomes live). Counters
    /// cover the connector's lifetime and survive a reset.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.started = now;
        self.last_ping = None;
        self.waiting_for_pong = false;
        self.last_rtt = None;
    }

    pub fn record_ping(&mut self) {
        self.last_ping = Some(Instant::now());
        self.waiting_for_pong = true;
        self.pings_sent += 1;
    }

    pub fn record_pong(&mut self) {
        let now = Instant::now();
        self.waiting_for_pong = false;
        self.pongs_received += 1;

        if let Some(ping_time) = self.last_ping {
            let rtt = now.saturating_duration_since(ping_time);
            self.last_rtt = Some(rtt);
            debug!(rtt_ms = rtt.as_millis() as u64, "Received pong");
        }
    }

    /// Next instant at which `poll` has something to do.
    pub fn next_deadline(&self) -> Instant {
        match (self.waiting_for_pong, self.last_ping) {
            (true, Some(ping)) => ping + self.pong_timeout,
            (_, Some(ping)) => ping + self.ping_interval,
            (_, None) => self.started + self.ping_interval,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        match (self.waiting_for_pong, self.last_ping) {
            (true, Some(ping)) => Instant::now().saturating_duration_since(ping) >= self.pong_timeout,
            _ => false,
        }
    }

    /// Decide what to do now.
    pub fn poll(&self) -> KeepaliveAction {
        if self.waiting_for_pong {
            if self.is_timed_out() {
                KeepaliveAction::TimedOut
            } else {
                KeepaliveAction::Idle
            }
        } else if Instant::now() >= self.next_deadline() {
            KeepaliveAction::SendPing
        } else {
            KeepaliveAction::Idle
        }
    }

    pub fn pong_timeout(&self) -> Duration {
        self.pong_timeout
    }

    pub fn stats(&self) -> KeepaliveStats {
        KeepaliveStats {
            pings_sent: self.pings_sent,
            pongs_received: self.pongs_received,
            waiting_for_pong: self.waiting_for_pong,
            last_rtt_ms: self.last_rtt.map(|rtt| rtt.as_millis() as u64),
        }
    }
}

/// Keepalive counters, published in the connector snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeepaliveStats {
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub waiting_for_pong: bool,
    pub last_rtt_ms: Option<u64>,
}
