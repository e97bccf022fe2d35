// =============================================================================
// Market Feed — WebSocket adapter for the live event stream
// =============================================================================
//
// Subscribes to the combined trade / bookTicker / depth-diff streams for one
// symbol and decodes each frame into a MarketEvent. The adapter assigns a
// local monotonic seq_id at receipt, so a healthy connection is gap-free by
// construction and reconnects are visible to the gap detector through
// FeedHealth. The aggregator consumes only the event channel; any ordered
// source can replace this adapter.
//
// Runs until the stream disconnects or an error occurs, then returns so that
// the caller (main.rs) can handle reconnection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::types::{BestBidAskEvent, DepthDiffEvent, LevelDelta, MarketEvent, TradeEvent};

// ---------------------------------------------------------------------------
// FeedHealth
// ---------------------------------------------------------------------------

/// Transport health shared with the gap detector's connection-loss rule.
#[derive(Debug)]
pub struct FeedHealth {
    connected: AtomicBool,
    disconnected_since: Mutex<Option<Instant>>,
    last_event_at: Mutex<Option<Instant>>,
}

impl FeedHealth {
    /// Starts disconnected: a transport that never comes up is itself a
    /// discontinuity.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            disconnected_since: Mutex::new(Some(Instant::now())),
            last_event_at: Mutex::new(None),
        }
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
        *self.disconnected_since.lock() = None;
    }

    pub fn mark_disconnected(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return; // already down; keep the original timestamp
        }
        *self.disconnected_since.lock() = Some(Instant::now());
    }

    pub fn note_event(&self) {
        *self.last_event_at.lock() = Some(Instant::now());
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// How long the transport has been down, if it is.
    pub fn disconnected_for(&self) -> Option<Duration> {
        self.disconnected_since.lock().map(|at| at.elapsed())
    }
}

impl Default for FeedHealth {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// MarketFeed
// ---------------------------------------------------------------------------

pub struct MarketFeed {
    config: Arc<PipelineConfig>,
    health: Arc<FeedHealth>,
    seq: AtomicU64,
}

impl MarketFeed {
    pub fn new(config: Arc<PipelineConfig>, health: Arc<FeedHealth>) -> Self {
        Self {
            config,
            health,
            seq: AtomicU64::new(0),
        }
    }

    fn stream_url(&self) -> String {
        let s = self.config.symbol.to_lowercase();
        format!(
            "{}?streams={s}@trade/{s}@bookTicker/{s}@depth@100ms",
            self.config.feed_url
        )
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// One connection lifecycle: connect, subscribe, decode until the stream
    /// drops or shutdown is signalled.
    pub async fn run_once(
        &self,
        event_tx: &mpsc::Sender<MarketEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let url = self.stream_url();
        info!(url = %url, "connecting to market feed");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("failed to connect to market feed")?;

        self.health.mark_connected();
        info!(symbol = %self.config.symbol, "market feed connected");

        let (_write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        match self.decode(&text) {
                            Ok(Some(event)) => {
                                self.health.note_event();
                                if event_tx.send(event).await.is_err() {
                                    warn!("event channel closed; feed exiting");
                                    return Ok(());
                                }
                            }
                            Ok(None) => {} // subscription acks, unknown frames
                            Err(e) => {
                                warn!(error = %e, "failed to decode feed message");
                            }
                        }
                    }
                    // Ping/Pong/Binary frames: tungstenite answers pings
                    // automatically.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.health.mark_disconnected();
                        return Err(e).context("market feed read error");
                    }
                    None => {
                        self.health.mark_disconnected();
                        warn!("market feed stream ended");
                        return Ok(());
                    }
                },
                _ = shutdown.changed() => {
                    info!("market feed shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Decode one combined-stream frame. Returns `None` for frames that carry
    /// no market event.
    fn decode(&self, text: &str) -> Result<Option<MarketEvent>> {
        let root: serde_json::Value =
            serde_json::from_str(text).context("failed to parse feed JSON")?;

        // Combined-stream envelope; fall back to the bare payload.
        let data = if root.get("data").is_some() {
            &root["data"]
        } else {
            &root
        };

        match data["e"].as_str() {
            Some("trade") => Ok(Some(self.decode_trade(data)?)),
            Some("depthUpdate") => Ok(Some(self.decode_depth(data)?)),
            Some(_) => Ok(None),
            // bookTicker frames carry no event type tag.
            None if data.get("b").is_some() && data.get("a").is_some() => {
                Ok(Some(self.decode_book_ticker(data)?))
            }
            None => Ok(None),
        }
    }

    fn decode_trade(&self, data: &serde_json::Value) -> Result<MarketEvent> {
        let trade_id = data["t"].as_u64().context("missing field t")?;
        let price = parse_string_f64(&data["p"], "p")?;
        let size = parse_string_f64(&data["q"], "q")?;
        let trade_ts_ms = data["T"].as_i64().context("missing field T")?;
        let buyer_is_maker = data["m"].as_bool().context("missing field m")?;

        Ok(MarketEvent::Trade(TradeEvent {
            event_ts_us: trade_ts_ms * 1_000,
            trade_id,
            price,
            size,
            buyer_is_maker,
            seq_id: self.next_seq(),
        }))
    }

    fn decode_book_ticker(&self, data: &serde_json::Value) -> Result<MarketEvent> {
        let bid_px = parse_string_f64(&data["b"], "b")?;
        let bid_sz = parse_string_f64(&data["B"], "B")?;
        let ask_px = parse_string_f64(&data["a"], "a")?;
        let ask_sz = parse_string_f64(&data["A"], "A")?;

        // bookTicker frames carry no exchange timestamp; stamp receipt time.
        let event_ts_us = chrono::Utc::now().timestamp_micros();

        Ok(MarketEvent::BestBidAsk(BestBidAskEvent {
            event_ts_us,
            bid_px,
            bid_sz,
            ask_px,
            ask_sz,
            seq_id: self.next_seq(),
        }))
    }

    fn decode_depth(&self, data: &serde_json::Value) -> Result<MarketEvent> {
        let event_ts_ms = data["E"].as_i64().context("missing field E")?;
        let first_update_id = data["U"].as_u64().context("missing field U")?;
        let final_update_id = data["u"].as_u64().context("missing field u")?;

        let bids = parse_deltas(&data["b"], "b")?;
        let asks = parse_deltas(&data["a"], "a")?;

        Ok(MarketEvent::DepthDiff(DepthDiffEvent {
            event_ts_us: event_ts_ms * 1_000,
            first_update_id,
            final_update_id,
            bids,
            asks,
            seq_id: self.next_seq(),
        }))
    }
}

/// Helper: exchange feeds send numeric values as JSON strings.
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

fn parse_deltas(val: &serde_json::Value, name: &str) -> Result<Vec<LevelDelta>> {
    let arr = val
        .as_array()
        .with_context(|| format!("missing field {name}"))?;

    let mut deltas = Vec::with_capacity(arr.len());
    for entry in arr {
        let pair = entry
            .as_array()
            .with_context(|| format!("{name} entry is not an array"))?;
        if pair.len() < 2 {
            anyhow::bail!("{name} entry too short");
        }
        deltas.push(LevelDelta {
            price: parse_string_f64(&pair[0], name)?,
            size: parse_string_f64(&pair[1], name)?,
        });
    }
    Ok(deltas)
}
