// =============================================================================
// Watched-symbol registry
// =============================================================================
//
// Written by the supervisor at start and by `Watchlist` mutations after
// that. Every other loop reads an owned snapshot at the start of its unit of
// work, so a change made mid-cycle is first seen by the next cycle.
// =============================================================================

use std::collections::BTreeSet;

use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct WatchedSymbols {
    inner: RwLock<BTreeSet<String>>,
}

impl WatchedSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owned copy of the current set, in sorted order.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.read().iter().cloned().collect()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.inner.read().contains(symbol)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Insert `added` and drop `removed` in one write.
    pub fn apply(&self, added: &[String], removed: &[String]) {
        let mut set = self.inner.write();
        for sym in removed {
            set.remove(sym);
        }
        set.extend(added.iter().cloned());
    }
}
