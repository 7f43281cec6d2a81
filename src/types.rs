// =============================================================================
// Shared types used across the kline mirror
// =============================================================================

use serde::{Deserialize, Serialize};

/// One minute in epoch milliseconds. Every window, slot and threshold in the
/// engine is a whole multiple of this.
pub const MINUTE_MS: i64 = 60_000;

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Round `ms` down to the start of its minute.
pub fn floor_to_minute(ms: i64) -> i64 {
    ms.div_euclid(MINUTE_MS) * MINUTE_MS
}

/// Normalise a user-supplied symbol (`" btcusdt "` → `"BTCUSDT"`).
/// Returns `None` for blank input.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let sym = raw.trim().to_uppercase();
    if sym.is_empty() {
        None
    } else {
        Some(sym)
    }
}

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

/// A raw one-minute record as returned by a batch market data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineRecord {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A closed one-minute OHLCV candle. `end_ms` is always `start_ms + 60 000`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        symbol: impl Into<String>,
        start_ms: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            start_ms,
            end_ms: start_ms + MINUTE_MS,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Map a fetched record onto a candle for `symbol`.
    pub fn from_record(symbol: &str, record: &KlineRecord) -> Self {
        Self::new(
            symbol,
            record.timestamp_ms,
            record.open,
            record.high,
            record.low,
            record.close,
            record.volume,
        )
    }
}

// ---------------------------------------------------------------------------
// Windows and integrity
// ---------------------------------------------------------------------------

/// Half-open time window `[start_ms, end_ms)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeWindow {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }

    /// The analysis window ending `offset_minutes` before `now_ms` and
    /// spanning `duration_minutes`, aligned to minute boundaries.
    pub fn trailing(now_ms: i64, offset_minutes: u64, duration_minutes: u64) -> Self {
        let end_ms = floor_to_minute(now_ms) - offset_minutes as i64 * MINUTE_MS;
        let start_ms = end_ms - duration_minutes as i64 * MINUTE_MS;
        Self { start_ms, end_ms }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end_ms - self.start_ms).max(0)
    }

    /// Number of whole one-minute slots in the window.
    pub fn minutes(&self) -> i64 {
        self.duration_ms() / MINUTE_MS
    }

    pub fn is_empty(&self) -> bool {
        self.end_ms <= self.start_ms
    }

    pub fn contains(&self, ms: i64) -> bool {
        ms >= self.start_ms && ms < self.end_ms
    }

    /// Split into consecutive, non-overlapping sub-windows of at most
    /// `chunk_ms`, in increasing time order.
    pub fn split(&self, chunk_ms: i64) -> Vec<TimeWindow> {
        let mut out = Vec::new();
        if chunk_ms <= 0 {
            return out;
        }
        let mut cursor = self.start_ms;
        while cursor < self.end_ms {
            let end = (cursor + chunk_ms).min(self.end_ms);
            out.push(TimeWindow::new(cursor, end));
            cursor = end;
        }
        out
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start_ms, self.end_ms)
    }
}

/// Result of a coverage check for one symbol over one window. Produced per
/// check, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub symbol: String,
    pub window: TimeWindow,
    /// Share of expected one-minute slots holding a candle, in `[0, 100]`.
    pub coverage_percentage: f64,
    /// Maximal runs of empty slots as half-open `(start_ms, end_ms)`, ordered.
    pub missing_ranges: Vec<(i64, i64)>,
}

impl IntegrityReport {
    /// Smallest window covering every missing range, if any.
    pub fn missing_envelope(&self) -> Option<TimeWindow> {
        let first = self.missing_ranges.first()?;
        let last = self.missing_ranges.last()?;
        Some(TimeWindow::new(first.0, last.1))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
