// =============================================================================
// Backfill Reconciler — keeps the analysis window covered for every symbol
// =============================================================================
//
// One cycle:
//   1. Snapshot the watched symbols (sorted) and read the config once.
//   2. Per symbol, compute the trailing window and ask the store how much of
//      it is covered. At or above 90% nothing is fetched.
//   3. Below that, fetch the envelope of the missing ranges in 24-hour
//      sub-windows, oldest first, and upsert every record that falls inside.
//
// A failed fetch or save is logged and that sub-window is left for the next
// cycle. An unknown symbol skips the rest of that symbol. Only a failed
// integrity check aborts the cycle, and then the next one starts after
// 5 minutes instead of 30.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{CycleError, ErrorScope};
use crate::notify::{notify_best_effort, SystemEvent};
use crate::ports::{BatchMarketDataSource, DataStore, NotificationSink};
use crate::registry::WatchedSymbols;
use crate::run_flag::RunFlag;
use crate::runtime_config::{PolledConfig, RuntimeConfig};
use crate::types::{now_ms, Candle, TimeWindow, MINUTE_MS};

/// Coverage at or above which a symbol is left alone.
pub const COVERAGE_THRESHOLD: f64 = 90.0;
/// Largest window requested from the batch source in one call.
pub const SUB_WINDOW_MS: i64 = 24 * 60 * MINUTE_MS;
/// Wait after a cycle that finished.
pub const CYCLE_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Wait after a cycle that aborted.
pub const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Courtesy delays towards the exchange.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub between_requests: Duration,
    pub between_symbols: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            between_requests: Duration::from_millis(100),
            between_symbols: Duration::from_millis(500),
        }
    }
}

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Symbols processed, in order.
    pub symbols: Vec<String>,
    pub checked: usize,
    /// Symbols that were below the threshold and got fetched.
    pub backfilled: usize,
    pub candles_saved: usize,
    pub failed_fetches: usize,
    /// Sub-windows cut short by a store write failure.
    pub failed_saves: usize,
    /// Symbols given up on for this cycle (unknown to the exchange).
    pub skipped_symbols: Vec<String>,
}

impl CycleReport {
    fn new(symbols: Vec<String>) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            started_at: Utc::now(),
            symbols,
            checked: 0,
            backfilled: 0,
            candles_saved: 0,
            failed_fetches: 0,
            failed_saves: 0,
            skipped_symbols: Vec::new(),
        }
    }
}

pub struct BackfillReconciler {
    registry: Arc<WatchedSymbols>,
    store: Arc<dyn DataStore>,
    source: Arc<dyn BatchMarketDataSource>,
    config: Arc<PolledConfig>,
    notifier: Arc<dyn NotificationSink>,
    pacing: Pacing,
    last_report: RwLock<Option<CycleReport>>,
}

impl BackfillReconciler {
    pub fn new(
        registry: Arc<WatchedSymbols>,
        store: Arc<dyn DataStore>,
        source: Arc<dyn BatchMarketDataSource>,
        config: Arc<PolledConfig>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            registry,
            store,
            source,
            config,
            notifier,
            pacing: Pacing::default(),
            last_report: RwLock::new(None),
        }
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().clone()
    }

    // -------------------------------------------------------------------------
    // Loop
    // -------------------------------------------------------------------------

    pub async fn run(&self, shutdown: &RunFlag) {
        info!(
            interval_secs = CYCLE_INTERVAL.as_secs(),
            retry_secs = ERROR_RETRY_INTERVAL.as_secs(),
            "backfill reconciler started"
        );

        while shutdown.is_running() {
            let wait = match self.run_cycle(now_ms(), shutdown).await {
                Ok(report) => {
                    info!(
                        cycle_id = %report.cycle_id,
                        symbols = report.symbols.len(),
                        backfilled = report.backfilled,
                        candles_saved = report.candles_saved,
                        failed_fetches = report.failed_fetches,
                        failed_saves = report.failed_saves,
                        "backfill cycle complete"
                    );
                    *self.last_report.write() = Some(report.clone());
                    notify_best_effort(
                        self.notifier.as_ref(),
                        SystemEvent::BackfillCycleCompleted { report },
                    );
                    CYCLE_INTERVAL
                }
                Err(CycleError::Stopped) => break,
                Err(e) => {
                    warn!(
                        error = %e,
                        scope = ?e.scope(),
                        retry_in_secs = ERROR_RETRY_INTERVAL.as_secs(),
                        "backfill cycle aborted"
                    );
                    notify_best_effort(
                        self.notifier.as_ref(),
                        SystemEvent::BackfillCycleFailed {
                            error: e.to_string(),
                        },
                    );
                    ERROR_RETRY_INTERVAL
                }
            };

            if !shutdown.sleep(wait).await {
                break;
            }
        }

        info!("backfill reconciler stopped");
    }

    // -------------------------------------------------------------------------
    // One cycle
    // -------------------------------------------------------------------------

    /// Reconcile every symbol watched at the moment the cycle starts.
    pub async fn run_cycle(&self, now_ms: i64, shutdown: &RunFlag) -> Result<CycleReport, CycleError> {
        let cfg = self.config.current();
        let report = CycleReport::new(self.registry.snapshot());
        let span = info_span!("backfill_cycle", cycle_id = %report.cycle_id);

        self.reconcile_all(report, &cfg, now_ms, shutdown)
            .instrument(span)
            .await
    }

    async fn reconcile_all(
        &self,
        mut report: CycleReport,
        cfg: &RuntimeConfig,
        now_ms: i64,
        shutdown: &RunFlag,
    ) -> Result<CycleReport, CycleError> {
        let window = TimeWindow::trailing(now_ms, cfg.offset_minutes, cfg.analysis_minutes());
        debug!(symbols = report.symbols.len(), window = %window, "cycle started");

        let symbols = report.symbols.clone();
        for (i, symbol) in symbols.iter().enumerate() {
            if !shutdown.is_running() {
                return Err(CycleError::Stopped);
            }
            if i > 0 && !shutdown.sleep(self.pacing.between_symbols).await {
                return Err(CycleError::Stopped);
            }
            self.reconcile_symbol(symbol, window, shutdown, &mut report)
                .await?;
        }

        Ok(report)
    }

    async fn reconcile_symbol(
        &self,
        symbol: &str,
        window: TimeWindow,
        shutdown: &RunFlag,
        report: &mut CycleReport,
    ) -> Result<(), CycleError> {
        let integrity = self
            .store
            .check_integrity(symbol, window)
            .await
            .map_err(|source| CycleError::Integrity {
                symbol: symbol.to_string(),
                source,
            })?;
        report.checked += 1;

        if integrity.coverage_percentage >= COVERAGE_THRESHOLD {
            debug!(
                symbol,
                coverage = integrity.coverage_percentage,
                "coverage sufficient"
            );
            return Ok(());
        }
        let Some(missing) = integrity.missing_envelope() else {
            return Ok(());
        };

        info!(
            symbol,
            coverage = integrity.coverage_percentage,
            gaps = integrity.missing_ranges.len(),
            missing_minutes = missing.minutes(),
            "coverage below threshold, backfilling"
        );
        report.backfilled += 1;

        for (i, sub) in missing.split(SUB_WINDOW_MS).into_iter().enumerate() {
            if i > 0 && !shutdown.sleep(self.pacing.between_requests).await {
                return Err(CycleError::Stopped);
            }

            match self.source.get_candles(symbol, sub.start_ms, sub.end_ms).await {
                Ok(records) => {
                    let mut saved = 0;
                    for record in records.iter().filter(|r| sub.contains(r.timestamp_ms)) {
                        if let Err(e) = self.store.save_candle(&Candle::from_record(symbol, record)).await {
                            report.failed_saves += 1;
                            warn!(symbol, window = %sub, saved, error = %e, "save failed, rest of sub-window left for next cycle");
                            break;
                        }
                        saved += 1;
                    }
                    debug!(symbol, window = %sub, received = records.len(), saved, "sub-window filled");
                    report.candles_saved += saved;
                }
                Err(e) => {
                    report.failed_fetches += 1;
                    warn!(symbol, window = %sub, error = %e, "sub-window fetch failed, left for next cycle");
                    if e.skips_symbol() {
                        report.skipped_symbols.push(symbol.to_string());
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::DataStore;
    use crate::runtime_config::StaticConfig;
    use crate::storage::MemoryStore;
    use crate::testing::{FlakyStore, RecordingSink, RecordingSource, SharedConfig};
    use parking_lot::Mutex;
    use tokio::time::Instant;

    const HOUR_MS: i64 = 60 * MINUTE_MS;
    /// Minute-aligned "now".
    const NOW: i64 = 1_000 * HOUR_MS;

    struct Harness {
        registry: Arc<WatchedSymbols>,
        store: Arc<MemoryStore>,
        source: Arc<RecordingSource>,
        sink: Arc<RecordingSink>,
        reconciler: Arc<BackfillReconciler>,
    }

    fn harness(symbols: &[&str], analysis_hours: u64) -> Harness {
        let registry = Arc::new(WatchedSymbols::new());
        let seed: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
        registry.apply(&seed, &[]);

        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(RecordingSource::new());
        let sink = Arc::new(RecordingSink::default());
        let config = Arc::new(PolledConfig::new(StaticConfig(RuntimeConfig {
            analysis_hours,
            ..RuntimeConfig::default()
        })));
        let reconciler = Arc::new(BackfillReconciler::new(
            registry.clone(),
            store.clone(),
            source.clone(),
            config,
            sink.clone(),
        ));
        Harness {
            registry,
            store,
            source,
            sink,
            reconciler,
        }
    }

    async fn fill(store: &MemoryStore, symbol: &str, window: TimeWindow, skip: usize) {
        let total = window.minutes() as usize;
        for minute in 0..total - skip {
            let start = window.start_ms + minute as i64 * MINUTE_MS;
            store
                .save_candle(&Candle::new(symbol, start, 1.0, 1.0, 1.0, 1.0, 1.0))
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sufficient_coverage_issues_no_fetch() {
        let h = harness(&["BTCUSDT"], 1);
        let window = TimeWindow::trailing(NOW, 0, 60);
        // 54 of 60 slots = exactly 90%.
        fill(&h.store, "BTCUSDT", window, 6).await;

        let report = h.reconciler.run_cycle(NOW, &RunFlag::new()).await.unwrap();

        assert!(h.source.calls().is_empty());
        assert_eq!(report.checked, 1);
        assert_eq!(report.backfilled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fifty_missing_hours_take_three_ordered_fetches() {
        let h = harness(&["ETHUSDT"], 50);

        let report = h.reconciler.run_cycle(NOW, &RunFlag::new()).await.unwrap();

        let calls = h.source.calls_for("ETHUSDT");
        let lengths: Vec<i64> = calls.iter().map(|w| w.duration_ms() / HOUR_MS).collect();
        assert_eq!(lengths, vec![24, 24, 2]);
        for pair in calls.windows(2) {
            assert!(pair[0].end_ms <= pair[1].start_ms);
            assert!(pair[0].start_ms < pair[1].start_ms);
        }
        assert_eq!(calls[0].start_ms, NOW - 50 * HOUR_MS);
        assert_eq!(calls[2].end_ms, NOW);

        assert_eq!(report.candles_saved, 50 * 60);
        let after = h
            .store
            .check_integrity("ETHUSDT", TimeWindow::trailing(NOW, 0, 50 * 60))
            .await
            .unwrap();
        assert_eq!(after.coverage_percentage, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_symbol_does_not_block_the_next_one() {
        let h = harness(&["AAAUSDT", "BBBUSDT"], 1);
        h.source.fail_for("AAAUSDT");

        let report = h.reconciler.run_cycle(NOW, &RunFlag::new()).await.unwrap();

        assert_eq!(h.source.calls_for("AAAUSDT").len(), 1);
        assert_eq!(h.source.calls_for("BBBUSDT").len(), 1);
        assert_eq!(report.failed_fetches, 1);
        assert_eq!(h.store.count("AAAUSDT"), 0);
        assert_eq!(h.store.count("BBBUSDT"), 60);
        assert!(report.skipped_symbols.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_symbol_skips_its_remaining_sub_windows() {
        let h = harness(&["DEADUSDT", "ETHUSDT"], 50);
        h.source.unknown("DEADUSDT");

        let report = h.reconciler.run_cycle(NOW, &RunFlag::new()).await.unwrap();

        assert_eq!(h.source.calls_for("DEADUSDT").len(), 1);
        assert_eq!(h.source.calls_for("ETHUSDT").len(), 3);
        assert_eq!(report.skipped_symbols, vec!["DEADUSDT".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn symbol_added_mid_cycle_waits_for_the_next_cycle() {
        let h = harness(&["BTCUSDT", "ETHUSDT"], 1);
        let registry = h.registry.clone();
        h.source.on_fetch(move |_| registry.apply(&["FOOUSDT".into()], &[]));

        let first = h.reconciler.run_cycle(NOW, &RunFlag::new()).await.unwrap();
        assert!(!first.symbols.contains(&"FOOUSDT".to_string()));
        assert!(h.source.calls_for("FOOUSDT").is_empty());

        let second = h.reconciler.run_cycle(NOW, &RunFlag::new()).await.unwrap();
        assert!(second.symbols.contains(&"FOOUSDT".to_string()));
        assert_eq!(h.source.calls_for("FOOUSDT").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_gaps_fetch_only_their_envelope() {
        let h = harness(&["BTCUSDT"], 1);
        let window = TimeWindow::trailing(NOW, 0, 60);
        // Only the first 20 minutes present.
        fill(&h.store, "BTCUSDT", window, 40).await;

        h.reconciler.run_cycle(NOW, &RunFlag::new()).await.unwrap();

        let calls = h.source.calls_for("BTCUSDT");
        assert_eq!(calls, vec![TimeWindow::new(window.start_ms + 20 * MINUTE_MS, window.end_ms)]);
    }

    #[tokio::test]
    async fn integrity_failure_aborts_the_cycle() {
        let registry = Arc::new(WatchedSymbols::new());
        registry.apply(&["BTCUSDT".into(), "ETHUSDT".into()], &[]);
        let store = Arc::new(FlakyStore::failing());
        let source = Arc::new(RecordingSource::new());
        let reconciler = BackfillReconciler::new(
            registry,
            store.clone(),
            source.clone(),
            Arc::new(PolledConfig::new(StaticConfig::default())),
            Arc::new(RecordingSink::default()),
        );

        let err = reconciler.run_cycle(NOW, &RunFlag::new()).await.unwrap_err();
        assert!(matches!(err, CycleError::Integrity { ref symbol, .. } if symbol == "BTCUSDT"));
        assert_eq!(store.integrity_calls(), 1);
        assert!(source.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_cycles_retry_after_five_minutes() {
        let registry = Arc::new(WatchedSymbols::new());
        registry.apply(&["BTCUSDT".into()], &[]);
        let store = Arc::new(FlakyStore::failing());
        let sink = Arc::new(RecordingSink::default());
        let reconciler = Arc::new(BackfillReconciler::new(
            registry,
            store.clone(),
            Arc::new(RecordingSource::new()),
            Arc::new(PolledConfig::new(StaticConfig::default())),
            sink.clone(),
        ));
        let shutdown = RunFlag::new();

        let task = {
            let reconciler = reconciler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { reconciler.run(&shutdown).await })
        };

        // Cycles at 0, 5 and 10 minutes.
        tokio::time::sleep(Duration::from_secs(11 * 60)).await;
        assert_eq!(store.integrity_calls(), 3);
        assert!(sink.contains(|e| matches!(e, SystemEvent::BackfillCycleFailed { .. })));
        assert!(reconciler.last_report().is_none());

        shutdown.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn completed_cycles_repeat_every_thirty_minutes() {
        let h = harness(&["BTCUSDT"], 1);
        let shutdown = RunFlag::new();

        let task = {
            let reconciler = h.reconciler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { reconciler.run(&shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(29 * 60)).await;
        let first = h.reconciler.last_report().expect("first cycle report");
        assert_eq!(first.checked, 1);

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        let second = h.reconciler.last_report().expect("second cycle report");
        assert_ne!(first.cycle_id, second.cycle_id);
        assert!(h.sink.contains(|e| matches!(e, SystemEvent::BackfillCycleCompleted { .. })));

        shutdown.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_cycle_between_symbols() {
        let h = harness(&["AAAUSDT", "BBBUSDT"], 1);
        let shutdown = RunFlag::new();
        let flag = shutdown.clone();
        h.source.on_fetch(move |_| flag.stop());

        let err = h.reconciler.run_cycle(NOW, &shutdown).await.unwrap_err();
        assert!(matches!(err, CycleError::Stopped));
        assert!(h.source.calls_for("BBBUSDT").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn save_failure_is_confined_to_its_symbol() {
        let registry = Arc::new(WatchedSymbols::new());
        registry.apply(&["AAAUSDT".into(), "BBBUSDT".into()], &[]);
        let store = Arc::new(FlakyStore::default());
        store.fail_saves_for("AAAUSDT");
        let source = Arc::new(RecordingSource::new());
        let reconciler = BackfillReconciler::new(
            registry,
            store.clone(),
            source.clone(),
            Arc::new(PolledConfig::new(StaticConfig::default())),
            Arc::new(RecordingSink::default()),
        );

        let report = reconciler.run_cycle(NOW, &RunFlag::new()).await.unwrap();

        assert_eq!(report.failed_saves, 1);
        assert_eq!(report.checked, 2);
        assert_eq!(source.calls_for("BBBUSDT").len(), 1);
        assert_eq!(store.inner.count("AAAUSDT"), 0);
        assert_eq!(store.inner.count("BBBUSDT"), 60);
        assert_eq!(report.candles_saved, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_are_paced_between_requests_and_symbols() {
        let h = harness(&["AAAUSDT", "BBBUSDT"], 50);
        let stamps = Arc::new(Mutex::new(Vec::new()));
        {
            let stamps = stamps.clone();
            h.source.on_fetch(move |_| stamps.lock().push(Instant::now()));
        }

        h.reconciler.run_cycle(NOW, &RunFlag::new()).await.unwrap();

        let pacing = Pacing::default();
        let stamps = stamps.lock().clone();
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                pacing.between_requests,
                pacing.between_requests,
                pacing.between_symbols,
                pacing.between_requests,
                pacing.between_requests,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn config_changes_apply_from_the_next_cycle() {
        let registry = Arc::new(WatchedSymbols::new());
        registry.apply(&["BTCUSDT".into()], &[]);
        let config = SharedConfig::new(RuntimeConfig {
            analysis_hours: 1,
            ..RuntimeConfig::default()
        });
        let source = Arc::new(RecordingSource::new());
        let reconciler = BackfillReconciler::new(
            registry,
            Arc::new(MemoryStore::new()),
            source.clone(),
            Arc::new(PolledConfig::new(config.clone())),
            Arc::new(RecordingSink::default()),
        );

        reconciler.run_cycle(NOW, &RunFlag::new()).await.unwrap();
        assert_eq!(source.calls_for("BTCUSDT"), vec![TimeWindow::new(NOW - HOUR_MS, NOW)]);

        // Two hours ending 30 minutes ago: the newest half hour is already
        // stored, the older 90 minutes are not.
        config.update(|cfg| {
            cfg.analysis_hours = 2;
            cfg.offset_minutes = 30;
        });
        reconciler.run_cycle(NOW, &RunFlag::new()).await.unwrap();

        let calls = source.calls_for("BTCUSDT");
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1],
            TimeWindow::new(NOW - 30 * MINUTE_MS - 2 * HOUR_MS, NOW - HOUR_MS)
        );
    }
}
