// =============================================================================
// Watchlist — the one place the watched-symbol set changes
// =============================================================================
//
// A mutation persists to the store first, then updates the registry, then
// moves the live feed's topics. Mutations run one at a time: the diff is
// computed while holding the mutation lock, so two callers adding the same
// symbol produce a single SUBSCRIBE.
//
// `run_config_sync` watches the configured `symbols` list and applies every
// edit through `replace`.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::SupervisorError;
use crate::feed_connection::FeedConnection;
use crate::notify::{notify_best_effort, SystemEvent};
use crate::ports::{DataStore, NotificationSink};
use crate::registry::WatchedSymbols;
use crate::run_flag::RunFlag;
use crate::runtime_config::PolledConfig;
use crate::types::normalize_symbol;

/// How often the configured symbol list is compared against the last one seen.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Symbols that actually changed in one watchlist mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchlistChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl WatchlistChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct Watchlist {
    registry: Arc<WatchedSymbols>,
    store: Arc<dyn DataStore>,
    feed: Arc<FeedConnection>,
    notifier: Arc<dyn NotificationSink>,
    mutation: Mutex<()>,
}

impl Watchlist {
    pub fn new(
        registry: Arc<WatchedSymbols>,
        store: Arc<dyn DataStore>,
        feed: Arc<FeedConnection>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            registry,
            store,
            feed,
            notifier,
            mutation: Mutex::new(()),
        }
    }

    pub async fn add(&self, symbols: &[String]) -> Result<WatchlistChange, SupervisorError> {
        let _guard = self.mutation.lock().await;
        let added = normalize_all(symbols)
            .into_iter()
            .filter(|s| !self.registry.contains(s))
            .collect();
        self.apply(WatchlistChange {
            added,
            removed: Vec::new(),
        })
        .await
    }

    pub async fn remove(&self, symbols: &[String]) -> Result<WatchlistChange, SupervisorError> {
        let _guard = self.mutation.lock().await;
        let removed = normalize_all(symbols)
            .into_iter()
            .filter(|s| self.registry.contains(s))
            .collect();
        self.apply(WatchlistChange {
            added: Vec::new(),
            removed,
        })
        .await
    }

    /// Make the watchlist exactly `symbols`.
    pub async fn replace(&self, symbols: &[String]) -> Result<WatchlistChange, SupervisorError> {
        let _guard = self.mutation.lock().await;
        let wanted: BTreeSet<String> = normalize_all(symbols).into_iter().collect();
        let current: BTreeSet<String> = self.registry.snapshot().into_iter().collect();
        self.apply(WatchlistChange {
            added: wanted.difference(&current).cloned().collect(),
            removed: current.difference(&wanted).cloned().collect(),
        })
        .await
    }

    /// Caller holds the mutation lock.
    async fn apply(&self, change: WatchlistChange) -> Result<WatchlistChange, SupervisorError> {
        if change.is_empty() {
            return Ok(change);
        }

        if !change.added.is_empty() {
            self.store
                .add_watched_symbols(&change.added)
                .await
                .map_err(SupervisorError::Persist)?;
        }
        if !change.removed.is_empty() {
            self.store
                .remove_watched_symbols(&change.removed)
                .await
                .map_err(SupervisorError::Persist)?;
        }

        self.registry.apply(&change.added, &change.removed);

        if let Err(e) = self.feed.subscribe(&change.added).await {
            warn!(symbols = ?change.added, error = %e, "subscribe failed");
        }
        if let Err(e) = self.feed.unsubscribe(&change.removed).await {
            warn!(symbols = ?change.removed, error = %e, "unsubscribe failed");
        }

        info!(
            added = ?change.added,
            removed = ?change.removed,
            watched = self.registry.len(),
            "watchlist updated"
        );
        notify_best_effort(
            self.notifier.as_ref(),
            SystemEvent::WatchlistChanged {
                added: change.added.clone(),
                removed: change.removed.clone(),
            },
        );
        Ok(change)
    }

    // -------------------------------------------------------------------------
    // Config-driven refresh
    // -------------------------------------------------------------------------

    /// Apply edits of the configured symbol list until shutdown.
    ///
    /// The list seen at start is the baseline, so a watchlist loaded from the
    /// store is only replaced once the config actually changes.
    pub async fn run_config_sync(&self, config: &PolledConfig, shutdown: &RunFlag) {
        let mut observed = normalize_all(&config.current().symbols);
        info!(
            interval_secs = SYNC_INTERVAL.as_secs(),
            "watchlist sync started"
        );

        while shutdown.sleep(SYNC_INTERVAL).await {
            let wanted = normalize_all(&config.current().symbols);
            if wanted == observed {
                continue;
            }
            if wanted.is_empty() {
                warn!("configured symbol list is empty, keeping the current watchlist");
                observed = wanted;
                continue;
            }

            match self.replace(&wanted).await {
                Ok(change) => {
                    info!(
                        added = change.added.len(),
                        removed = change.removed.len(),
                        "watchlist synced from config"
                    );
                    observed = wanted;
                }
                Err(e) => warn!(error = %e, "watchlist sync failed, retrying on next poll"),
            }
        }

        info!("watchlist sync stopped");
    }
}

/// Upper-case, trim and de-duplicate, dropping blanks.
pub fn normalize_all(symbols: &[String]) -> Vec<String> {
    symbols
        .iter()
        .filter_map(|s| normalize_symbol(s))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
