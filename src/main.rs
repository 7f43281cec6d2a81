// =============================================================================
// Kline Mirror — Main Entry Point
// =============================================================================
//
// Keeps a local, continuously reconciled copy of one-minute Binance candles
// for a changing set of symbols. Live candles arrive over one WebSocket,
// gaps are backfilled over REST, and old data is pruned hourly.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kline_mirror::binance::{BinanceClient, BinanceKlineFeed};
use kline_mirror::notify::{spawn_event_logger, BroadcastSink};
use kline_mirror::ports::Maintainable;
use kline_mirror::runtime_config::{FileConfigProvider, PolledConfig, RuntimeConfig, SeedOverride};
use kline_mirror::storage::{MemoryStore, SnapshotCheckpoint};
use kline_mirror::supervisor::{SupervisorParts, SystemSupervisor};
use kline_mirror::types;

const DEFAULT_CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Kline Mirror — starting up");

    let config_path =
        std::env::var("KLINE_MIRROR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    // Write the defaults out once so the file exists to be edited.
    if !Path::new(&config_path).exists() {
        warn!(path = %config_path, "config file missing, writing defaults");
        if let Err(e) = RuntimeConfig::default().save(&config_path) {
            error!(error = %e, "failed to write default config");
        }
    }

    let file = FileConfigProvider::new(&config_path);
    let config = match std::env::var("KLINE_MIRROR_SYMBOLS") {
        Ok(raw) => {
            let symbols: Vec<String> = raw
                .split(',')
                .filter_map(types::normalize_symbol)
                .collect();
            info!(symbols = ?symbols, "seed symbols overridden from environment");
            Arc::new(PolledConfig::new(SeedOverride::new(file, symbols)))
        }
        Err(_) => Arc::new(PolledConfig::new(file)),
    };
    let startup = config.current();

    // ── 2. Store ─────────────────────────────────────────────────────────
    let store = Arc::new(match &startup.snapshot_path {
        Some(path) => MemoryStore::load_snapshot(path)
            .with_context(|| format!("failed to load candle snapshot from {path}"))?,
        None => MemoryStore::new(),
    });

    let mut maintainables: Vec<Arc<dyn Maintainable>> = vec![store.clone() as Arc<dyn Maintainable>];
    if let Some(path) = &startup.snapshot_path {
        maintainables.push(Arc::new(SnapshotCheckpoint::new(store.clone(), path)));
    }

    // ── 3. Exchange collaborators ────────────────────────────────────────
    let client = Arc::new(BinanceClient::new(&startup.rest_base_url)?);
    let (candle_tx, candle_rx) = mpsc::unbounded_channel();
    let feed = Arc::new(BinanceKlineFeed::new(&startup.ws_url, candle_tx));

    // ── 4. Notifications ─────────────────────────────────────────────────
    let events = Arc::new(BroadcastSink::new());
    let _event_logger = spawn_event_logger(&events);

    // ── 5. Supervisor ────────────────────────────────────────────────────
    let supervisor = SystemSupervisor::new(SupervisorParts {
        store: store.clone(),
        source: client,
        feed,
        maintainables,
        config,
        notifier: events,
    });
    supervisor.start().await?;
    supervisor.attach_live_ingest(candle_rx);

    info!(
        watched = supervisor.stats().watched_count,
        "all loops running. Press Ctrl+C to stop."
    );

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    supervisor.shutdown().await;

    if let Some(path) = &startup.snapshot_path {
        if let Err(e) = store.save_snapshot(path) {
            error!(error = %e, "failed to save candle snapshot on shutdown");
        }
    }

    info!("Kline Mirror shut down complete.");
    Ok(())
}
