// =============================================================================
// Binance REST API Client — historical one-minute klines
// =============================================================================
//
// Only public market-data endpoints are used, so requests are unsigned.
// Every response feeds the shared `RateLimitTracker`; a request that would
// push the used weight past the hard cap is refused locally instead of
// risking a 429 / IP ban.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;
use crate::error::SourceError;
use crate::ports::BatchMarketDataSource;
use crate::types::{KlineRecord, MINUTE_MS};

/// Maximum rows Binance returns per klines request.
const KLINES_PAGE_LIMIT: usize = 1000;
/// Request weight of `GET /api/v3/klines` at limit 1000.
const KLINES_WEIGHT: u32 = 2;
/// Binance error code for an unknown / delisted symbol.
const INVALID_SYMBOL_CODE: i64 = -1121;

/// Binance REST client for historical candles.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            base_url,
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        })
    }

    #[cfg(test)]
    pub fn rate_limit(&self) -> crate::binance::rate_limit::RateLimitSnapshot {
        self.rate_limit.snapshot()
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines for one page, `interval=1m`.
    ///
    /// Binance treats `endTime` as inclusive; callers pass the last millisecond
    /// they want.
    #[instrument(skip(self), name = "binance::get_klines_page")]
    async fn get_klines_page(
        &self,
        symbol: &str,
        start_ms: i64,
        end_inclusive_ms: i64,
    ) -> Result<Vec<KlineRecord>, SourceError> {
        if !self.rate_limit.can_send_request(KLINES_WEIGHT) {
            return Err(SourceError::RateLimited(format!(
                "local weight cap reached ({} used)",
                self.rate_limit.snapshot().used_weight_1m
            )));
        }

        let url = format!(
            "{}/api/v3/klines?symbol={}&interval=1m&startTime={}&endTime={}&limit={}",
            self.base_url, symbol, start_ms, end_inclusive_ms, KLINES_PAGE_LIMIT
        );

        let resp = self.client.get(&url).send().await?;
        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(classify_failure(symbol, status, &text));
        }

        let body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| SourceError::Decode(format!("klines body is not JSON: {e}")))?;
        let rows = parse_klines(&body)?;
        debug!(symbol, count = rows.len(), "klines page fetched");
        Ok(rows)
    }

    /// Fetch every one-minute kline in `[start_ms, end_ms)`, paging as needed.
    #[instrument(skip(self), name = "binance::get_candles")]
    pub async fn fetch_range(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<KlineRecord>, SourceError> {
        let mut out: Vec<KlineRecord> = Vec::new();
        let mut cursor = start_ms;

        while cursor < end_ms {
            let page = self.get_klines_page(symbol, cursor, end_ms - 1).await?;
            let full_page = page.len() >= KLINES_PAGE_LIMIT;

            let Some(last_ts) = page.last().map(|r| r.timestamp_ms) else {
                break;
            };
            out.extend(
                page.into_iter()
                    .filter(|r| r.timestamp_ms >= cursor && r.timestamp_ms < end_ms),
            );

            if !full_page || last_ts < cursor {
                break;
            }
            cursor = last_ts + MINUTE_MS;
        }

        Ok(out)
    }
}

#[async_trait]
impl BatchMarketDataSource for BinanceClient {
    async fn get_candles(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<KlineRecord>, SourceError> {
        self.fetch_range(symbol, start_ms, end_ms).await
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Response handling
// -----------------------------------------------------------------------------

/// Classify a non-2xx response. The body may be an HTML error page, so it is
/// only parsed as JSON to look up Binance's error `code`.
fn classify_failure(symbol: &str, status: StatusCode, body: &str) -> SourceError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        warn!(symbol, status = %status, "Binance rate limit response");
        return SourceError::RateLimited(format!("HTTP {status}"));
    }
    let code = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("code").and_then(|c| c.as_i64()));
    if code == Some(INVALID_SYMBOL_CODE) {
        return SourceError::UnknownSymbol(symbol.to_string());
    }
    SourceError::Exchange {
        status: status.as_u16(),
        body: body.chars().take(200).collect(),
    }
}

/// Parse Binance's array-of-arrays klines payload.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume, ...
fn parse_klines(body: &serde_json::Value) -> Result<Vec<KlineRecord>, SourceError> {
    let raw = body
        .as_array()
        .ok_or_else(|| SourceError::Decode("klines response is not an array".into()))?;

    let mut rows = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry
            .as_array()
            .ok_or_else(|| SourceError::Decode("kline entry is not an array".into()))?;

        if arr.len() < 6 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let timestamp_ms = arr[0]
            .as_i64()
            .ok_or_else(|| SourceError::Decode("kline open time is not an integer".into()))?;

        rows.push(KlineRecord {
            timestamp_ms,
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
        });
    }
    Ok(rows)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64, SourceError> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| SourceError::Decode(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(SourceError::Decode(format!("expected string or number, got: {val}")))
    }
}
