// =============================================================================
// Scripted collaborators shared by the unit tests
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{CleanupError, ConfigError, FeedError, NotifyError, SourceError, StoreError};
use crate::notify::SystemEvent;
use crate::ports::{
    BatchMarketDataSource, DataStore, LinkObserver, Maintainable, MaintenanceContext,
    NotificationSink, StreamingFeed,
};
use crate::runtime_config::{ConfigProvider, RuntimeConfig};
use crate::storage::MemoryStore;
use crate::types::{Candle, IntegrityReport, KlineRecord, TimeWindow, MINUTE_MS};

// ---------------------------------------------------------------------------
// Streaming feed
// ---------------------------------------------------------------------------

/// What one `connect()` call does.
#[derive(Debug, Clone, Copy)]
pub enum ConnectStep {
    Fail,
    EstablishThenClose,
    EstablishThenFail,
    EstablishThenHang,
    Hang,
}

pub struct ScriptedFeed {
    steps: Mutex<VecDeque<ConnectStep>>,
    fallback: ConnectStep,
    connects: AtomicUsize,
    subscribed: Mutex<Vec<Vec<String>>>,
    unsubscribed: Mutex<Vec<Vec<String>>>,
}

impl ScriptedFeed {
    /// Plays `steps` in order, then `fallback` forever.
    pub fn new(steps: Vec<ConnectStep>, fallback: ConnectStep) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback,
            connects: AtomicUsize::new(0),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
        }
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn subscribed(&self) -> Vec<Vec<String>> {
        self.subscribed.lock().clone()
    }

    pub fn unsubscribed(&self) -> Vec<Vec<String>> {
        self.unsubscribed.lock().clone()
    }
}

#[async_trait]
impl StreamingFeed for ScriptedFeed {
    async fn connect(&self, link: &dyn LinkObserver) -> Result<(), FeedError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().pop_front().unwrap_or(self.fallback);
        // Let the caller observe intermediate state between attempts.
        tokio::time::sleep(Duration::from_millis(10)).await;
        match step {
            ConnectStep::Fail => Err(FeedError::TransientNetwork("connection refused".into())),
            ConnectStep::EstablishThenClose => {
                link.established();
                Ok(())
            }
            ConnectStep::EstablishThenFail => {
                link.established();
                Err(FeedError::TransientNetwork("connection reset".into()))
            }
            ConnectStep::EstablishThenHang => {
                link.established();
                std::future::pending().await
            }
            ConnectStep::Hang => std::future::pending().await,
        }
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        self.subscribed.lock().push(symbols.to_vec());
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        self.unsubscribed.lock().push(symbols.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Batch source
// ---------------------------------------------------------------------------

type FetchHook = Box<dyn Fn(&str) + Send + Sync>;

/// Returns one record for every minute asked for, recording each call.
#[derive(Default)]
pub struct RecordingSource {
    calls: Mutex<Vec<(String, TimeWindow)>>,
    failing: Mutex<HashSet<String>>,
    unknown: Mutex<HashSet<String>>,
    on_fetch: Mutex<Option<FetchHook>>,
}

impl RecordingSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, symbol: &str) {
        self.failing.lock().insert(symbol.to_string());
    }

    pub fn unknown(&self, symbol: &str) {
        self.unknown.lock().insert(symbol.to_string());
    }

    /// Run `hook` at the start of every fetch.
    pub fn on_fetch(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_fetch.lock() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<(String, TimeWindow)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, symbol: &str) -> Vec<TimeWindow> {
        self.calls
            .lock()
            .iter()
            .filter(|(s, _)| s == symbol)
            .map(|(_, w)| *w)
            .collect()
    }
}

#[async_trait]
impl BatchMarketDataSource for RecordingSource {
    async fn get_candles(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<KlineRecord>, SourceError> {
        self.calls
            .lock()
            .push((symbol.to_string(), TimeWindow::new(start_ms, end_ms)));
        if let Some(hook) = self.on_fetch.lock().as_ref() {
            hook(symbol);
        }
        if self.failing.lock().contains(symbol) {
            return Err(SourceError::Network("timed out".into()));
        }
        if self.unknown.lock().contains(symbol) {
            return Err(SourceError::UnknownSymbol(symbol.to_string()));
        }

        let mut out = Vec::new();
        let mut ts = start_ms;
        while ts < end_ms {
            out.push(KlineRecord {
                timestamp_ms: ts,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
            });
            ts += MINUTE_MS;
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// `MemoryStore` with switchable failures and slow watchlist writes.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    fail_integrity: AtomicBool,
    fail_writes: AtomicBool,
    failing_saves: Mutex<HashSet<String>>,
    write_delay: Duration,
    integrity_calls: AtomicUsize,
}

fn unavailable(reason: &str) -> StoreError {
    StoreError::Io(std::io::Error::other(reason.to_string()))
}

impl FlakyStore {
    pub fn failing() -> Self {
        let store = Self::default();
        store.fail_integrity.store(true, Ordering::SeqCst);
        store
    }

    /// Watchlist writes sleep for `delay` before landing.
    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            write_delay: delay,
            ..Self::default()
        }
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn heal_writes(&self) {
        self.fail_writes.store(false, Ordering::SeqCst);
    }

    pub fn fail_saves_for(&self, symbol: &str) {
        self.failing_saves.lock().insert(symbol.to_string());
    }

    pub fn integrity_calls(&self) -> usize {
        self.integrity_calls.load(Ordering::SeqCst)
    }

    async fn before_write(&self) -> Result<(), StoreError> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(unavailable("read-only file system"));
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for FlakyStore {
    async fn get_watched_symbols(&self) -> Result<Vec<String>, StoreError> {
        self.inner.get_watched_symbols().await
    }

    async fn add_watched_symbols(&self, symbols: &[String]) -> Result<(), StoreError> {
        self.before_write().await?;
        self.inner.add_watched_symbols(symbols).await
    }

    async fn remove_watched_symbols(&self, symbols: &[String]) -> Result<(), StoreError> {
        self.before_write().await?;
        self.inner.remove_watched_symbols(symbols).await
    }

    async fn check_integrity(
        &self,
        symbol: &str,
        window: TimeWindow,
    ) -> Result<IntegrityReport, StoreError> {
        self.integrity_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_integrity.load(Ordering::SeqCst) {
            return Err(unavailable("database is locked"));
        }
        self.inner.check_integrity(symbol, window).await
    }

    async fn save_candle(&self, candle: &Candle) -> Result<(), StoreError> {
        let failing = self.failing_saves.lock().contains(&candle.symbol);
        if failing {
            return Err(unavailable("disk full"));
        }
        self.inner.save_candle(candle).await
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Config provider whose value a test can edit between polls.
#[derive(Clone, Default)]
pub struct SharedConfig(Arc<Mutex<RuntimeConfig>>);

impl SharedConfig {
    pub fn new(cfg: RuntimeConfig) -> Self {
        Self(Arc::new(Mutex::new(cfg)))
    }

    pub fn update(&self, edit: impl FnOnce(&mut RuntimeConfig)) {
        edit(&mut self.0.lock());
    }
}

impl ConfigProvider for SharedConfig {
    fn load(&self) -> Result<RuntimeConfig, ConfigError> {
        Ok(self.0.lock().clone())
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SystemEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SystemEvent> {
        self.events.lock().clone()
    }

    pub fn contains(&self, pred: impl Fn(&SystemEvent) -> bool) -> bool {
        self.events.lock().iter().any(pred)
    }
}

impl NotificationSink for RecordingSink {
    fn broadcast(&self, event: SystemEvent) -> Result<(), NotifyError> {
        self.events.lock().push(event);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Maintenance delegates
// ---------------------------------------------------------------------------

/// Counts cleanup calls and the virtual time each one started at.
pub struct CountingTask {
    name: &'static str,
    fail: bool,
    work: Duration,
    started: Mutex<Vec<tokio::time::Instant>>,
    contexts: Mutex<Vec<MaintenanceContext>>,
}

impl CountingTask {
    pub fn ok(name: &'static str) -> Self {
        Self::build(name, false, Duration::ZERO)
    }

    pub fn failing(name: &'static str) -> Self {
        Self::build(name, true, Duration::ZERO)
    }

    pub fn slow(name: &'static str, work: Duration) -> Self {
        Self::build(name, false, work)
    }

    fn build(name: &'static str, fail: bool, work: Duration) -> Self {
        Self {
            name,
            fail,
            work,
            started: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.started.lock().len()
    }

    pub fn started(&self) -> Vec<tokio::time::Instant> {
        self.started.lock().clone()
    }

    pub fn contexts(&self) -> Vec<MaintenanceContext> {
        self.contexts.lock().clone()
    }
}

#[async_trait]
impl Maintainable for CountingTask {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn cleanup(&self, ctx: &MaintenanceContext) -> Result<(), CleanupError> {
        self.started.lock().push(tokio::time::Instant::now());
        self.contexts.lock().push(*ctx);
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        if self.fail {
            return Err(CleanupError::Store {
                component: self.name,
                source: unavailable("disk full"),
            });
        }
        Ok(())
    }
}
