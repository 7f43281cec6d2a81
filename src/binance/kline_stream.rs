// =============================================================================
// Kline Stream Feed — one Binance WebSocket carrying every watched symbol
// =============================================================================
//
// The feed remembers the desired topic set (`<symbol>@kline_1m`). On each
// connect it dials the raw stream endpoint, subscribes to the whole set in
// one request, and then pumps frames. While connected, `subscribe` and
// `unsubscribe` are turned into SUBSCRIBE / UNSUBSCRIBE control frames sent
// over the open socket, so the topic set changes without a reconnect.
//
// Parsed candles (closed and in-progress) are forwarded on an mpsc channel to
// whoever consumes them downstream.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::ports::{LinkObserver, StreamingFeed};
use crate::types::Candle;

/// A candle update received from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveCandle {
    pub candle: Candle,
    pub is_closed: bool,
}

#[derive(Debug)]
enum Control {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// Clears the live control channel when the connection future ends or is
/// dropped.
struct ControlGuard<'a>(&'a Mutex<Option<mpsc::UnboundedSender<Control>>>);

impl Drop for ControlGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

pub struct BinanceKlineFeed {
    url: String,
    topics: RwLock<BTreeSet<String>>,
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    out: mpsc::UnboundedSender<LiveCandle>,
    next_request_id: AtomicU64,
}

impl BinanceKlineFeed {
    pub fn new(url: impl Into<String>, out: mpsc::UnboundedSender<LiveCandle>) -> Self {
        Self {
            url: url.into(),
            topics: RwLock::new(BTreeSet::new()),
            control: Mutex::new(None),
            out,
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Symbols currently in the desired topic set.
    pub fn topics(&self) -> Vec<String> {
        self.topics.read().iter().cloned().collect()
    }

    fn is_live(&self) -> bool {
        self.control.lock().is_some()
    }

    fn stream_name(symbol: &str) -> String {
        format!("{}@kline_1m", symbol.to_lowercase())
    }

    fn request(&self, method: &str, symbols: &[String]) -> String {
        let params: Vec<String> = symbols.iter().map(|s| Self::stream_name(s)).collect();
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        json!({ "method": method, "params": params, "id": id }).to_string()
    }

    fn send_control(&self, control: Control) {
        let tx = self.control.lock().clone();
        if let Some(tx) = tx {
            if tx.send(control).is_err() {
                debug!("control channel closed; change applies on next connect");
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match parse_kline_message(text) {
            Ok(Some(live)) => {
                debug!(
                    symbol = %live.candle.symbol,
                    close = live.candle.close,
                    closed = live.is_closed,
                    "candle update"
                );
                if self.out.send(live).is_err() {
                    debug!("live candle receiver dropped");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to parse kline message"),
        }
    }
}

#[async_trait]
impl StreamingFeed for BinanceKlineFeed {
    async fn connect(&self, link: &dyn LinkObserver) -> Result<(), FeedError> {
        info!(url = %self.url, "connecting to kline WebSocket");
        let (ws_stream, _response) = connect_async(&self.url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.control.lock() = Some(tx);
        let _guard = ControlGuard(&self.control);

        let initial = self.topics();
        if !initial.is_empty() {
            write
                .send(Message::Text(self.request("SUBSCRIBE", &initial)))
                .await?;
        }
        info!(topics = initial.len(), "kline WebSocket connected");
        link.established();

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Ping(payload))) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(frame = ?frame, "kline WebSocket closed by server");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        warn!("kline WebSocket stream ended");
                        return Ok(());
                    }
                },
                Some(control) = rx.recv() => {
                    let text = match &control {
                        Control::Subscribe(symbols) => self.request("SUBSCRIBE", symbols),
                        Control::Unsubscribe(symbols) => self.request("UNSUBSCRIBE", symbols),
                    };
                    debug!(control = ?control, "sending topic change");
                    write.send(Message::Text(text)).await?;
                }
            }
        }
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        let added: Vec<String> = {
            let mut topics = self.topics.write();
            symbols
                .iter()
                .filter(|s| topics.insert((*s).clone()))
                .cloned()
                .collect()
        };
        if added.is_empty() {
            return Ok(());
        }
        if self.is_live() {
            self.send_control(Control::Subscribe(added));
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        let removed: Vec<String> = {
            let mut topics = self.topics.write();
            symbols
                .iter()
                .filter(|s| topics.remove(s.as_str()))
                .cloned()
                .collect()
        };
        if removed.is_empty() {
            return Ok(());
        }
        if self.is_live() {
            self.send_control(Control::Unsubscribe(removed));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a kline frame (combined `{stream, data}` envelope or raw payload).
/// Subscription acknowledgements (`{"result": null, "id": n}`) yield `None`.
fn parse_kline_message(text: &str) -> Result<Option<LiveCandle>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    if root.get("result").is_some() && root.get("id").is_some() {
        return Ok(None);
    }

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    if data["e"].as_str() != Some("kline") {
        return Ok(None);
    }

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let k = &data["k"];
    let start_ms = k["t"].as_i64().context("missing field k.t")?;
    let open = parse_string_f64(&k["o"], "k.o")?;
    let high = parse_string_f64(&k["h"], "k.h")?;
    let low = parse_string_f64(&k["l"], "k.l")?;
    let close = parse_string_f64(&k["c"], "k.c")?;
    let volume = parse_string_f64(&k["v"], "k.v")?;
    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    Ok(Some(LiveCandle {
        candle: Candle::new(symbol, start_ms, open, high, low, close, volume),
        is_closed,
    }))
}

/// Binance sends numeric values as JSON strings inside kline objects.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
