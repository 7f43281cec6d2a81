// =============================================================================
// Collaborator Ports — the boundary between the continuity engine and the
// exchange, the persistence engine and the outside world
// =============================================================================

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{CleanupError, FeedError, NotifyError, SourceError, StoreError};
use crate::notify::SystemEvent;
use crate::types::{Candle, IntegrityReport, KlineRecord, TimeWindow};

/// Candle persistence and the persisted watchlist.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Watched symbols in a stable order.
    async fn get_watched_symbols(&self) -> Result<Vec<String>, StoreError>;

    async fn add_watched_symbols(&self, symbols: &[String]) -> Result<(), StoreError>;

    async fn remove_watched_symbols(&self, symbols: &[String]) -> Result<(), StoreError>;

    /// Coverage of `window` for `symbol` as currently stored. Never overstates.
    async fn check_integrity(
        &self,
        symbol: &str,
        window: TimeWindow,
    ) -> Result<IntegrityReport, StoreError>;

    /// Idempotent upsert keyed by `(symbol, start_ms)`.
    async fn save_candle(&self, candle: &Candle) -> Result<(), StoreError>;
}

/// Historical one-minute candles, fetched in bounded windows.
#[async_trait]
pub trait BatchMarketDataSource: Send + Sync {
    /// Records with `start_ms <= timestamp_ms < end_ms`, in increasing order.
    /// May be partial or empty where the exchange has gaps.
    async fn get_candles(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<KlineRecord>, SourceError>;
}

/// Handed to `StreamingFeed::connect` so the feed can report the moment the
/// link is up (handshake done, subscriptions sent).
pub trait LinkObserver: Send + Sync {
    fn established(&self);
}

/// A single persistent streaming connection.
#[async_trait]
pub trait StreamingFeed: Send + Sync {
    /// Dial and pump messages. Suspends until the connection ends (`Ok`) or
    /// fails (`Err`). Dropping the future closes the connection.
    async fn connect(&self, link: &dyn LinkObserver) -> Result<(), FeedError>;

    /// Add topics. Safe while connected; remembered for the next connect.
    async fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError>;

    /// Remove topics. Safe while connected.
    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError>;
}

/// Best-effort outward notifications.
pub trait NotificationSink: Send + Sync {
    fn broadcast(&self, event: SystemEvent) -> Result<(), NotifyError>;
}

/// Inputs shared by every cleanup delegate in one maintenance pass.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MaintenanceContext {
    pub now_ms: i64,
    /// Drop data that started before `now_ms - retention_ms`.
    pub retention_ms: i64,
}

/// A collaborator exposing a housekeeping capability.
#[async_trait]
pub trait Maintainable: Send + Sync {
    fn name(&self) -> &'static str;

    async fn cleanup(&self, ctx: &MaintenanceContext) -> Result<(), CleanupError>;
}
