// =============================================================================
// Kline Mirror — library root
// =============================================================================
//
// The engine is usable on its own: build a `SystemSupervisor` from
// `SupervisorParts`, `start()` it, and drive the watchlist through
// `add_symbols` / `remove_symbols` / `replace_symbols`. The binary wires it to
// Binance, the in-memory store and a config file.
// =============================================================================

pub mod backfill;
pub mod binance;
pub mod error;
pub mod feed_connection;
pub mod ingest;
pub mod maintenance;
pub mod notify;
pub mod ports;
pub mod registry;
pub mod run_flag;
pub mod runtime_config;
pub mod storage;
pub mod supervisor;
pub mod types;
pub mod watchlist;

#[cfg(test)]
mod testing;
