use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CleanupError, StoreError};
use crate::ports::{DataStore, Maintainable, MaintenanceContext};
use crate::types::{Candle, IntegrityReport, TimeWindow, MINUTE_MS};

// ---------------------------------------------------------------------------
// MemoryStore -- ordered candle map per symbol
// ---------------------------------------------------------------------------

/// Thread-safe candle store: one `start_ms`-ordered map per symbol plus the
/// persisted watchlist. Writes are upserts, so re-saving a candle replaces it
/// and never changes how many slots are covered.
#[derive(Default)]
pub struct MemoryStore {
    candles: RwLock<HashMap<String, BTreeMap<i64, Candle>>>,
    watched: RwLock<BTreeSet<String>>,
}

/// On-disk form written by `save_snapshot`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    watched: Vec<String>,
    #[serde(default)]
    candles: Vec<Candle>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of candles stored for `symbol`.
    #[cfg(test)]
    pub fn count(&self, symbol: &str) -> usize {
        self.candles.read().get(symbol).map_or(0, BTreeMap::len)
    }

    /// Candles for `symbol` in `window`, oldest first.
    #[cfg(test)]
    pub fn range(&self, symbol: &str, window: TimeWindow) -> Vec<Candle> {
        let map = self.candles.read();
        match map.get(symbol) {
            Some(series) if !window.is_empty() => series
                .range(window.start_ms..window.end_ms)
                .map(|(_, c)| c.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Drop every candle that started before `cutoff_ms`. Returns how many
    /// were removed.
    pub fn prune_before(&self, cutoff_ms: i64) -> usize {
        let watched = self.watched.read();
        let mut map = self.candles.write();
        let mut removed = 0;
        for series in map.values_mut() {
            let keep = series.split_off(&cutoff_ms);
            removed += series.len();
            *series = keep;
        }
        map.retain(|symbol, series| !series.is_empty() || watched.contains(symbol));
        removed
    }

    fn integrity(&self, symbol: &str, window: TimeWindow) -> IntegrityReport {
        let expected = window.minutes();
        if expected == 0 {
            return IntegrityReport {
                symbol: symbol.to_string(),
                window,
                coverage_percentage: 100.0,
                missing_ranges: Vec::new(),
            };
        }

        let map = self.candles.read();
        let series = map.get(symbol);

        let mut present: i64 = 0;
        let mut missing_ranges = Vec::new();
        let mut run_start: Option<i64> = None;

        for i in 0..expected {
            let slot = window.start_ms + i * MINUTE_MS;
            let covered = series.is_some_and(|s| s.contains_key(&slot));
            if covered {
                present += 1;
                if let Some(start) = run_start.take() {
                    missing_ranges.push((start, slot));
                }
            } else if run_start.is_none() {
                run_start = Some(slot);
            }
        }
        if let Some(start) = run_start {
            missing_ranges.push((start, window.start_ms + expected * MINUTE_MS));
        }

        IntegrityReport {
            symbol: symbol.to_string(),
            window,
            coverage_percentage: present as f64 / expected as f64 * 100.0,
            missing_ranges,
        }
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Load a snapshot written by `save_snapshot`. A missing file yields an
    /// empty store.
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let store = Self::new();
        if !path.exists() {
            info!(path = %path.display(), "no candle snapshot found, starting empty");
            return Ok(store);
        }

        let content = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;

        store.watched.write().extend(snapshot.watched);
        {
            let mut map = store.candles.write();
            for candle in snapshot.candles {
                map.entry(candle.symbol.clone())
                    .or_default()
                    .insert(candle.start_ms, candle);
            }
        }

        info!(
            path = %path.display(),
            symbols = store.candles.read().len(),
            "candle snapshot loaded"
        );
        Ok(store)
    }

    /// Write the whole store to `path` atomically (tmp + rename).
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        let snapshot = Snapshot {
            watched: self.watched.read().iter().cloned().collect(),
            candles: self
                .candles
                .read()
                .values()
                .flat_map(|series| series.values().cloned())
                .collect(),
        };

        let content = serde_json::to_string(&snapshot)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, path)?;

        debug!(path = %path.display(), candles = snapshot.candles.len(), "candle snapshot saved");
        Ok(())
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get_watched_symbols(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.watched.read().iter().cloned().collect())
    }

    async fn add_watched_symbols(&self, symbols: &[String]) -> Result<(), StoreError> {
        self.watched.write().extend(symbols.iter().cloned());
        Ok(())
    }

    async fn remove_watched_symbols(&self, symbols: &[String]) -> Result<(), StoreError> {
        let mut watched = self.watched.write();
        for sym in symbols {
            watched.remove(sym);
        }
        Ok(())
    }

    async fn check_integrity(
        &self,
        symbol: &str,
        window: TimeWindow,
    ) -> Result<IntegrityReport, StoreError> {
        Ok(self.integrity(symbol, window))
    }

    async fn save_candle(&self, candle: &Candle) -> Result<(), StoreError> {
        self.candles
            .write()
            .entry(candle.symbol.clone())
            .or_default()
            .insert(candle.start_ms, candle.clone());
        Ok(())
    }
}

#[async_trait]
impl Maintainable for MemoryStore {
    fn name(&self) -> &'static str {
        "candle-retention"
    }

    async fn cleanup(&self, ctx: &MaintenanceContext) -> Result<(), CleanupError> {
        let cutoff = ctx.now_ms - ctx.retention_ms;
        let removed = self.prune_before(cutoff);
        info!(removed, cutoff_ms = cutoff, "old candles pruned");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Snapshot checkpoint
// ---------------------------------------------------------------------------

/// Writes the store snapshot on every maintenance pass.
pub struct SnapshotCheckpoint {
    store: Arc<MemoryStore>,
    path: PathBuf,
}

impl SnapshotCheckpoint {
    pub fn new(store: Arc<MemoryStore>, path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }
}

#[async_trait]
impl Maintainable for SnapshotCheckpoint {
    fn name(&self) -> &'static str {
        "snapshot-checkpoint"
    }

    async fn cleanup(&self, _ctx: &MaintenanceContext) -> Result<(), CleanupError> {
        self.store
            .save_snapshot(&self.path)
            .map_err(|source| CleanupError::Store {
                component: self.name(),
                source,
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 60 * MINUTE_MS;

    fn candle(symbol: &str, start_ms: i64) -> Candle {
        Candle::new(symbol, start_ms, 1.0, 2.0, 0.5, 1.5, 10.0)
    }

    #[tokio::test]
    async fn empty_store_reports_one_gap_spanning_the_window() {
        let store = MemoryStore::new();
        let window = TimeWindow::new(0, HOUR_MS);
        let report = store.check_integrity("BTCUSDT", window).await.unwrap();
        assert_eq!(report.coverage_percentage, 0.0);
        assert_eq!(report.missing_ranges, vec![(0, HOUR_MS)]);
    }

    #[tokio::test]
    async fn coverage_counts_slots_and_reports_maximal_gaps() {
        let store = MemoryStore::new();
        for minute in [0, 1, 2, 5, 6, 9] {
            store.save_candle(&candle("ETHUSDT", minute * MINUTE_MS)).await.unwrap();
        }
        let window = TimeWindow::new(0, 10 * MINUTE_MS);
        let report = store.check_integrity("ETHUSDT", window).await.unwrap();

        assert!((report.coverage_percentage - 60.0).abs() < 1e-9);
        assert_eq!(
            report.missing_ranges,
            vec![(3 * MINUTE_MS, 5 * MINUTE_MS), (7 * MINUTE_MS, 9 * MINUTE_MS)]
        );
    }

    #[tokio::test]
    async fn saving_a_candle_marks_its_slot_covered_and_is_idempotent() {
        let store = MemoryStore::new();
        let window = TimeWindow::new(0, 4 * MINUTE_MS);
        let before = store.check_integrity("BTCUSDT", window).await.unwrap();

        let c = candle("BTCUSDT", 2 * MINUTE_MS);
        store.save_candle(&c).await.unwrap();
        let after = store.check_integrity("BTCUSDT", window).await.unwrap();
        assert!(after.coverage_percentage > before.coverage_percentage);
        assert!(after
            .missing_ranges
            .iter()
            .all(|&(s, e)| !(s <= c.start_ms && c.start_ms < e)));

        store.save_candle(&c).await.unwrap();
        let again = store.check_integrity("BTCUSDT", window).await.unwrap();
        assert_eq!(again.coverage_percentage, after.coverage_percentage);
        assert_eq!(store.count("BTCUSDT"), 1);
    }

    #[tokio::test]
    async fn zero_length_window_is_fully_covered() {
        let store = MemoryStore::new();
        let report = store
            .check_integrity("BTCUSDT", TimeWindow::new(HOUR_MS, HOUR_MS))
            .await
            .unwrap();
        assert_eq!(report.coverage_percentage, 100.0);
        assert!(report.missing_ranges.is_empty());
    }

    #[tokio::test]
    async fn watchlist_is_sorted_and_deduplicated() {
        let store = MemoryStore::new();
        store
            .add_watched_symbols(&["SOLUSDT".into(), "BTCUSDT".into(), "SOLUSDT".into()])
            .await
            .unwrap();
        store.remove_watched_symbols(&["XRPUSDT".into()]).await.unwrap();
        assert_eq!(
            store.get_watched_symbols().await.unwrap(),
            vec!["BTCUSDT".to_string(), "SOLUSDT".to_string()]
        );
    }

    #[tokio::test]
    async fn retention_cleanup_drops_only_old_candles() {
        let store = MemoryStore::new();
        for minute in 0..10 {
            store.save_candle(&candle("BTCUSDT", minute * MINUTE_MS)).await.unwrap();
        }
        store.save_candle(&candle("OLDUSDT", 0)).await.unwrap();

        let ctx = MaintenanceContext {
            now_ms: 10 * MINUTE_MS,
            retention_ms: 4 * MINUTE_MS,
        };
        store.cleanup(&ctx).await.unwrap();

        let kept = store.range("BTCUSDT", TimeWindow::new(0, HOUR_MS));
        assert_eq!(kept.len(), 4);
        assert_eq!(kept[0].start_ms, 6 * MINUTE_MS);
        assert_eq!(store.count("OLDUSDT"), 0);
    }

    #[tokio::test]
    async fn snapshot_roundtrip_restores_watchlist_and_candles() {
        let dir = std::env::temp_dir().join(format!("kline-mirror-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("candles_snapshot.json");

        let store = Arc::new(MemoryStore::new());
        store.add_watched_symbols(&["BTCUSDT".into()]).await.unwrap();
        store.save_candle(&candle("BTCUSDT", 0)).await.unwrap();
        store.save_candle(&candle("BTCUSDT", MINUTE_MS)).await.unwrap();

        let checkpoint = SnapshotCheckpoint::new(store.clone(), &path);
        checkpoint
            .cleanup(&MaintenanceContext { now_ms: 0, retention_ms: 0 })
            .await
            .unwrap();

        let restored = MemoryStore::load_snapshot(&path).unwrap();
        assert_eq!(restored.count("BTCUSDT"), 2);
        assert_eq!(
            restored.get_watched_symbols().await.unwrap(),
            vec!["BTCUSDT".to_string()]
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_snapshot_file_yields_empty_store() {
        let store = MemoryStore::load_snapshot("/nonexistent/kline-mirror/snap.json").unwrap();
        assert_eq!(store.count("BTCUSDT"), 0);
    }
}
