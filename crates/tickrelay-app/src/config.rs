//! Application configuration.
//!
//! Loaded from a TOML file, then overridden from `TICKRELAY__SECTION__KEY`
//! environment variables.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tickrelay_batch::BatcherConfig;
use tickrelay_dispatch::{GuardConfig, HttpClientConfig};
use tickrelay_ws::ConnectionConfig;

/// Default config path when neither CLI nor env var is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
/// Env var naming the config file.
pub const CONFIG_PATH_ENV: &str = "TICKRELAY_CONFIG";
const ENV_PREFIX: &str = "TICKRELAY";

// ============================================================================
// [feed]
// ============================================================================

/// Price feed connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_url")]
    pub url: String,
    #[serde(default)]
    pub fallback_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// 0 retries forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Request gzip responses from the downstream persistence service.
    #[serde(default = "default_true")]
    pub compression_enabled: bool,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    #[serde(default)]
    pub legacy_subscribe_enabled: bool,
    #[serde(default = "default_legacy_subscribe_delay_ms")]
    pub legacy_subscribe_delay_ms: u64,
}

fn default_feed_url() -> String {
    "wss://ws.kraken.com/v2".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_pong_timeout_ms() -> u64 {
    5000
}

fn default_subscribe_timeout_ms() -> u64 {
    5000
}

fn default_legacy_subscribe_delay_ms() -> u64 {
    1000
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            fallback_url: None,
            enabled: true,
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            compression_enabled: true,
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            legacy_subscribe_enabled: false,
            legacy_subscribe_delay_ms: default_legacy_subscribe_delay_ms(),
        }
    }
}

impl From<&FeedConfig> for ConnectionConfig {
    fn from(cfg: &FeedConfig) -> Self {
        Self {
            url: cfg.url.clone(),
            fallback_url: cfg.fallback_url.clone(),
            enabled: cfg.enabled,
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            reconnect_base_delay_ms: cfg.reconnect_base_delay_ms,
            reconnect_max_delay_ms: cfg.reconnect_max_delay_ms,
            connect_timeout_ms: cfg.connect_timeout_ms,
            ping_interval_ms: cfg.ping_interval_ms,
            pong_timeout_ms: cfg.pong_timeout_ms,
            subscribe_timeout_ms: cfg.subscribe_timeout_ms,
            legacy_subscribe_enabled: cfg.legacy_subscribe_enabled,
            legacy_subscribe_delay_ms: cfg.legacy_subscribe_delay_ms,
            ..Default::default()
        }
    }
}

// ============================================================================
// [batch]
// ============================================================================

/// Lane batching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
    #[serde(default = "default_secondary_batch_interval_ms")]
    pub secondary_batch_interval_ms: u64,
    #[serde(default = "default_secondary_batch_max_size")]
    pub secondary_batch_max_size: usize,
    /// Capacity of the flush -> dispatch channel.
    #[serde(default = "default_dispatch_queue")]
    pub dispatch_queue: usize,
}

fn default_batch_interval_ms() -> u64 {
    BatcherConfig::primary().interval_ms
}

fn default_batch_max_size() -> usize {
    BatcherConfig::primary().max_batch_size
}

fn default_secondary_batch_interval_ms() -> u64 {
    BatcherConfig::secondary().interval_ms
}

fn default_secondary_batch_max_size() -> usize {
    BatcherConfig::secondary().max_batch_size
}

fn default_dispatch_queue() -> usize {
    64
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            batch_max_size: default_batch_max_size(),
            secondary_batch_interval_ms: default_secondary_batch_interval_ms(),
            secondary_batch_max_size: default_secondary_batch_max_size(),
            dispatch_queue: default_dispatch_queue(),
        }
    }
}

impl BatchSettings {
    pub fn primary(&self) -> BatcherConfig {
        BatcherConfig {
            interval_ms: self.batch_interval_ms,
            max_batch_size: self.batch_max_size,
        }
    }

    pub fn secondary(&self) -> BatcherConfig {
        BatcherConfig {
            interval_ms: self.secondary_batch_interval_ms,
            max_batch_size: self.secondary_batch_max_size,
        }
    }
}

// ============================================================================
// [dispatch]
// ============================================================================

/// Downstream persistence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_database_retries")]
    pub max_database_retries: u32,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,
    #[serde(default = "default_backoff_ms")]
    pub default_backoff_ms: u64,
    #[serde(default = "default_pause_duration_ms")]
    pub pause_duration_ms: u64,
    /// Cap on entries per downstream call, held entries included.
    #[serde(default = "default_max_dispatch_size")]
    pub max_dispatch_size: usize,
    /// Persist the degraded-service state here across restarts.
    #[serde(default)]
    pub state_file: Option<String>,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080/api/prices".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_database_retries() -> u32 {
    GuardConfig::default().max_database_retries
}

fn default_breaker_threshold() -> u32 {
    GuardConfig::default().breaker_threshold
}

fn default_breaker_cooldown_ms() -> u64 {
    60_000
}

fn default_backoff_ms() -> u64 {
    5000
}

fn default_pause_duration_ms() -> u64 {
    30 * 60 * 1000
}

fn default_max_dispatch_size() -> usize {
    GuardConfig::default().max_dispatch_size
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            request_timeout_ms: default_request_timeout_ms(),
            max_database_retries: default_max_database_retries(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            default_backoff_ms: default_backoff_ms(),
            pause_duration_ms: default_pause_duration_ms(),
            max_dispatch_size: default_max_dispatch_size(),
            state_file: None,
        }
    }
}

impl DispatchSettings {
    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            breaker_threshold: self.breaker_threshold,
            breaker_cooldown: Duration::from_millis(self.breaker_cooldown_ms),
            default_backoff: Duration::from_millis(self.default_backoff_ms),
            max_database_retries: self.max_database_retries,
            pause_duration: Duration::from_millis(self.pause_duration_ms),
            max_dispatch_size: self.max_dispatch_size,
        }
    }

    pub fn http_config(&self, compression_enabled: bool) -> HttpClientConfig {
        HttpClientConfig {
            endpoint: self.endpoint.clone(),
            timeout: Duration::from_millis(self.request_timeout_ms),
            compression_enabled,
        }
    }
}

// ============================================================================
// [symbols] / [telemetry]
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolsConfig {
    /// Symbols to subscribe to.
    #[serde(default)]
    pub watched: Vec<String>,
    /// Subset routed through the primary (fast) lane.
    #[serde(default)]
    pub priority: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Broadcast capacity for UI event subscribers.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Interval between status log lines.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

fn default_event_buffer() -> usize {
    1024
}

fn default_status_interval_secs() -> u64 {
    60
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

// ============================================================================
// AppConfig
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub symbols: SymbolsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load using the standard lookup: `path` > `TICKRELAY_CONFIG` > default path.
    ///
    /// A missing file falls back to defaults (still subject to env overrides).
    pub fn load(path: Option<&str>) -> AppResult<Self> {
        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        if !Path::new(&path).exists() {
            tracing::warn!(path = %path, "Config file not found, using defaults");
        }
        Self::from_file(&path)
    }

    /// Load from a specific file plus environment overrides.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text without environment overrides.
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(format!("Failed to serialize config: {e}")))
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.feed.enabled && self.feed.url.trim().is_empty() {
            return Err(AppError::Config("feed.url is required when enabled".into()));
        }
        if self.feed.reconnect_base_delay_ms == 0 {
            return Err(AppError::Config(
                "feed.reconnect_base_delay_ms must be > 0".into(),
            ));
        }
        if self.feed.reconnect_max_delay_ms < self.feed.reconnect_base_delay_ms {
            return Err(AppError::Config(
                "feed.reconnect_max_delay_ms must be >= reconnect_base_delay_ms".into(),
            ));
        }
        for (name, lane) in [
            ("primary", self.batch.primary()),
            ("secondary", self.batch.secondary()),
        ] {
            lane.validate()
                .map_err(|e| AppError::Config(format!("{name} lane: {e}")))?;
        }
        if !self.dispatch.endpoint.starts_with("http://")
            && !self.dispatch.endpoint.starts_with("https://")
        {
            return Err(AppError::Config(format!(
                "dispatch.endpoint must be an http(s) URL, got {:?}",
                self.dispatch.endpoint
            )));
        }
        if self.dispatch.breaker_threshold == 0 {
            return Err(AppError::Config(
                "dispatch.breaker_threshold must be > 0".into(),
            ));
        }
        if self.dispatch.max_dispatch_size == 0 {
            return Err(AppError::Config(
                "dispatch.max_dispatch_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}
