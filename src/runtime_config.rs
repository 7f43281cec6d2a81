// =============================================================================
// Runtime Configuration — typed, re-read on every cycle, atomic save
// =============================================================================
//
// Every tunable lives in `RuntimeConfig`. Each field carries a serde default
// so a partial (or empty) JSON file is always valid, and adding a field never
// breaks an older file.
//
// Loops never cache the config across cycles: they call
// `PolledConfig::current()` at the start of each unit of work, so an edited
// file takes effect on the next cycle without a restart. When the file cannot
// be read, the last value that did load is used instead.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::types::MINUTE_MS;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_analysis_hours() -> u64 {
    1
}

fn default_offset_minutes() -> u64 {
    0
}

fn default_data_retention_hours() -> u64 {
    2
}

fn default_ws_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_reconnect_base_delay_secs() -> u64 {
    5
}

fn default_reconnect_max_delay_secs() -> u64 {
    60
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_snapshot_path() -> Option<String> {
    Some("candles_snapshot.json".to_string())
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Watchlist ----------------------------------------------------------

    /// Symbols used to seed the watchlist when the store has none.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Polled per cycle ---------------------------------------------------

    /// Length of the window the reconciler keeps covered.
    #[serde(default = "default_analysis_hours")]
    pub analysis_hours: u64,

    /// How far before "now" the analysis window ends.
    #[serde(default = "default_offset_minutes")]
    pub offset_minutes: u64,

    /// Candles older than this are dropped by the maintenance pass.
    #[serde(default = "default_data_retention_hours")]
    pub data_retention_hours: u64,

    // --- Read once at startup -----------------------------------------------

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_reconnect_base_delay_secs")]
    pub reconnect_base_delay_secs: u64,

    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,

    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// Upper bound on how long shutdown waits for each loop.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Where the candle store snapshot lives. `null` disables snapshots.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            analysis_hours: default_analysis_hours(),
            offset_minutes: default_offset_minutes(),
            data_retention_hours: default_data_retention_hours(),
            ws_url: default_ws_url(),
            rest_base_url: default_rest_base_url(),
            reconnect_base_delay_secs: default_reconnect_base_delay_secs(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            snapshot_path: default_snapshot_path(),
        }
    }
}

impl RuntimeConfig {
    /// Analysis window length in whole minutes.
    pub fn analysis_minutes(&self) -> u64 {
        self.analysis_hours * 60
    }

    /// Retention horizon in milliseconds, never shorter than the span the
    /// reconciler must keep covered (analysis window plus offset).
    pub fn effective_retention_ms(&self) -> i64 {
        let retention = self.data_retention_hours as i64 * 60 * MINUTE_MS;
        let required = (self.analysis_minutes() + self.offset_minutes) as i64 * MINUTE_MS;
        retention.max(required)
    }

    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        debug!(
            path = %path.display(),
            analysis_hours = config.analysis_hours,
            offset_minutes = config.offset_minutes,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Providers
// =============================================================================

/// Source of configuration values, asked afresh on every cycle.
pub trait ConfigProvider: Send + Sync {
    fn load(&self) -> Result<RuntimeConfig, ConfigError>;
}

/// Reads `RuntimeConfig` from a JSON file on every call.
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigProvider for FileConfigProvider {
    fn load(&self) -> Result<RuntimeConfig, ConfigError> {
        RuntimeConfig::load(&self.path).map_err(|e| ConfigError::Unavailable(format!("{e:#}")))
    }
}

/// Fixed configuration.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(pub RuntimeConfig);

#[cfg(test)]
impl ConfigProvider for StaticConfig {
    fn load(&self) -> Result<RuntimeConfig, ConfigError> {
        Ok(self.0.clone())
    }
}

/// Replaces the seed symbol list of another provider.
#[derive(Debug, Clone)]
pub struct SeedOverride<P> {
    inner: P,
    symbols: Vec<String>,
}

impl<P: ConfigProvider> SeedOverride<P> {
    pub fn new(inner: P, symbols: Vec<String>) -> Self {
        Self { inner, symbols }
    }
}

impl<P: ConfigProvider> ConfigProvider for SeedOverride<P> {
    fn load(&self) -> Result<RuntimeConfig, ConfigError> {
        self.inner.load().map(|mut cfg| {
            cfg.symbols = self.symbols.clone();
            cfg
        })
    }
}

/// Polls a provider and remembers the last value that loaded, so a missing
/// or corrupt file never stops a loop.
pub struct PolledConfig {
    provider: Box<dyn ConfigProvider>,
    last_good: RwLock<RuntimeConfig>,
}

impl PolledConfig {
    pub fn new(provider: impl ConfigProvider + 'static) -> Self {
        let initial = match provider.load() {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %e, "config unavailable at startup, using defaults");
                RuntimeConfig::default()
            }
        };
        Self {
            provider: Box::new(provider),
            last_good: RwLock::new(initial),
        }
    }

    /// Re-read the configuration, falling back to the last-known-good value.
    pub fn current(&self) -> RuntimeConfig {
        match self.provider.load() {
            Ok(cfg) => {
                *self.last_good.write() = cfg.clone();
                cfg
            }
            Err(e) => {
                warn!(error = %e, "config unavailable, using last known values");
                self.last_good.read().clone()
            }
        }
    }
}

impl std::fmt::Debug for PolledConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolledConfig")
            .field("last_good", &*self.last_good.read())
            .finish()
    }
}
