// =============================================================================
// Live ingest — closed stream candles into the store
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::binance::LiveCandle;
use crate::ports::DataStore;
use crate::registry::WatchedSymbols;
use crate::run_flag::RunFlag;

/// Persist every closed candle for a watched symbol until the channel closes
/// or the flag is cleared. In-progress updates are skipped.
pub async fn run_live_ingest(
    mut rx: mpsc::UnboundedReceiver<LiveCandle>,
    store: Arc<dyn DataStore>,
    registry: Arc<WatchedSymbols>,
    shutdown: RunFlag,
) {
    info!("live ingest started");
    let mut saved: u64 = 0;

    loop {
        let live = tokio::select! {
            msg = rx.recv() => match msg {
                Some(live) => live,
                None => break,
            },
            _ = shutdown.stopped() => break,
        };

        if !live.is_closed {
            continue;
        }
        // Frames can trail an unsubscribe.
        if !registry.contains(&live.candle.symbol) {
            debug!(symbol = %live.candle.symbol, "dropping candle for unwatched symbol");
            continue;
        }

        match store.save_candle(&live.candle).await {
            Ok(()) => {
                saved += 1;
                debug!(symbol = %live.candle.symbol, start_ms = live.candle.start_ms, "closed candle stored");
            }
            Err(e) => warn!(symbol = %live.candle.symbol, error = %e, "failed to store closed candle"),
        }
    }

    info!(saved, "live ingest stopped");
}
