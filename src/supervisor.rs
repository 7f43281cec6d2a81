// =============================================================================
// System Supervisor — orchestration root
// =============================================================================
//
// Owns the watched-symbol registry, the shared run flag and every background
// task handle. Startup seeds the registry from the store (or, if the store
// has none, from the configured symbols), subscribes the feed, and spawns the
// feed, backfill, maintenance and watchlist sync loops. Watchlist mutations
// are delegated to `Watchlist`.
//
// Shutdown clears the flag and joins tasks newest-first, each with a bounded
// wait; a task that overstays is aborted.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backfill::{BackfillReconciler, CycleReport};
use crate::binance::LiveCandle;
use crate::error::{ErrorScope, SupervisorError};
use crate::feed_connection::{BackoffPolicy, FeedConnection, FeedStats};
use crate::ingest::run_live_ingest;
use crate::maintenance::{MaintenancePass, MaintenanceScheduler};
use crate::ports::{BatchMarketDataSource, DataStore, Maintainable, NotificationSink, StreamingFeed};
use crate::registry::WatchedSymbols;
use crate::run_flag::RunFlag;
use crate::runtime_config::PolledConfig;
use crate::watchlist::{normalize_all, Watchlist, WatchlistChange};

/// Collaborators the supervisor is assembled from.
pub struct SupervisorParts {
    pub store: Arc<dyn DataStore>,
    pub source: Arc<dyn BatchMarketDataSource>,
    pub feed: Arc<dyn StreamingFeed>,
    pub maintainables: Vec<Arc<dyn Maintainable>>,
    pub config: Arc<PolledConfig>,
    pub notifier: Arc<dyn NotificationSink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStats {
    pub running: bool,
    pub watched_count: usize,
    pub watched_symbols: Vec<String>,
    pub feed: FeedStats,
    pub last_cycle: Option<CycleReport>,
    pub last_maintenance: Option<MaintenancePass>,
    pub uptime_secs: u64,
}

pub struct SystemSupervisor {
    registry: Arc<WatchedSymbols>,
    running: RunFlag,
    store: Arc<dyn DataStore>,
    config: Arc<PolledConfig>,
    feed: Arc<FeedConnection>,
    watchlist: Arc<Watchlist>,
    reconciler: Arc<BackfillReconciler>,
    maintenance: Arc<MaintenanceScheduler>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    started: AtomicBool,
    shutdown_timeout: Duration,
    created_at: Instant,
}

impl SystemSupervisor {
    pub fn new(parts: SupervisorParts) -> Self {
        let cfg = parts.config.current();
        let registry = Arc::new(WatchedSymbols::new());

        let feed = Arc::new(FeedConnection::new(
            parts.feed,
            BackoffPolicy::from_config(&cfg),
            parts.notifier.clone(),
        ));
        let reconciler = Arc::new(BackfillReconciler::new(
            registry.clone(),
            parts.store.clone(),
            parts.source,
            parts.config.clone(),
            parts.notifier.clone(),
        ));
        let maintenance = Arc::new(MaintenanceScheduler::new(
            parts.maintainables,
            parts.config.clone(),
            parts.notifier.clone(),
        ));
        let watchlist = Arc::new(Watchlist::new(
            registry.clone(),
            parts.store.clone(),
            feed.clone(),
            parts.notifier,
        ));

        Self {
            registry,
            running: RunFlag::new(),
            store: parts.store,
            config: parts.config,
            feed,
            watchlist,
            reconciler,
            maintenance,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown_timeout: Duration::from_secs(cfg.shutdown_timeout_secs),
            created_at: Instant::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Seed the registry and start the feed, backfill, maintenance and
    /// watchlist sync loops.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyStarted);
        }

        let mut symbols = self
            .store
            .get_watched_symbols()
            .await
            .map_err(SupervisorError::Seed)?;

        if symbols.is_empty() {
            symbols = normalize_all(&self.config.current().symbols);
            info!(symbols = ?symbols, "store has no watchlist, seeding from config");
            self.store
                .add_watched_symbols(&symbols)
                .await
                .map_err(SupervisorError::Persist)?;
        }

        self.registry.apply(&symbols, &[]);
        if let Err(e) = self.feed.subscribe(&self.registry.snapshot()).await {
            warn!(error = %e, "initial subscribe failed, topics apply on connect");
        }
        info!(watched = self.registry.len(), "watched symbols loaded");

        let feed = self.feed.clone();
        let flag = self.running.clone();
        self.track(
            "feed",
            tokio::spawn(async move {
                if let Err(e) = feed.run(&flag).await {
                    error!(
                        error = %e,
                        terminal = e.is_terminal(),
                        "feed connection stopped, external restart required"
                    );
                }
            }),
        );

        let reconciler = self.reconciler.clone();
        let flag = self.running.clone();
        self.track(
            "backfill",
            tokio::spawn(async move { reconciler.run(&flag).await }),
        );

        let maintenance = self.maintenance.clone();
        let flag = self.running.clone();
        self.track(
            "maintenance",
            tokio::spawn(async move { maintenance.run(&flag).await }),
        );

        let watchlist = self.watchlist.clone();
        let config = self.config.clone();
        let flag = self.running.clone();
        self.track(
            "watchlist_sync",
            tokio::spawn(async move { watchlist.run_config_sync(&config, &flag).await }),
        );

        info!("supervisor started");
        Ok(())
    }

    /// Run live ingestion as a supervised task.
    pub fn attach_live_ingest(&self, rx: mpsc::UnboundedReceiver<LiveCandle>) {
        let handle = tokio::spawn(run_live_ingest(
            rx,
            self.store.clone(),
            self.registry.clone(),
            self.running.clone(),
        ));
        self.track("ingest", handle);
    }

    fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().push((name, handle));
    }

    /// Stop every loop and wait for them, newest first.
    pub async fn shutdown(&self) {
        info!("supervisor shutting down");
        self.running.stop();
        self.feed.stop();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, mut handle) in tasks.into_iter().rev() {
            match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => info!(task = name, "task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task ended abnormally"),
                Err(_) => {
                    warn!(
                        task = name,
                        timeout_secs = self.shutdown_timeout.as_secs(),
                        "task did not stop in time, aborting"
                    );
                    handle.abort();
                }
            }
        }

        info!("supervisor stopped");
    }

    // -------------------------------------------------------------------------
    // Watchlist mutation
    // -------------------------------------------------------------------------

    pub async fn add_symbols(&self, symbols: &[String]) -> Result<WatchlistChange, SupervisorError> {
        self.watchlist.add(symbols).await
    }

    pub async fn remove_symbols(&self, symbols: &[String]) -> Result<WatchlistChange, SupervisorError> {
        self.watchlist.remove(symbols).await
    }

    /// Make the watchlist exactly `symbols`.
    pub async fn replace_symbols(&self, symbols: &[String]) -> Result<WatchlistChange, SupervisorError> {
        self.watchlist.replace(symbols).await
    }

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> SupervisorStats {
        let watched_symbols = self.registry.snapshot();
        SupervisorStats {
            running: self.running.is_running(),
            watched_count: watched_symbols.len(),
            watched_symbols,
            feed: self.feed.stats(),
            last_cycle: self.reconciler.last_report(),
            last_maintenance: self.maintenance.last_pass(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}
