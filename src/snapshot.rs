// =============================================================================
// Snapshot Source — authoritative depth + trades for re-anchoring
// =============================================================================
//
// The coordinator rebuilds hot state from this interface. Implementations
// must categorise failures (timeout / throttled / not-found / transient /
// permanent) so the retry policy can tell a retryable hiccup from a dead end.
//
// `RestSnapshotClient` talks to a Binance-style public REST API: unsigned
// endpoints only, numeric fields arrive as JSON strings.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::SnapshotError;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Depth snapshot returned by the source. Levels are (price, size).
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub update_id: u64,
    /// Server-side timestamp of the snapshot, microseconds.
    pub server_ts_us: i64,
}

/// One historical trade returned by the source.
#[derive(Debug, Clone)]
pub struct SnapshotTrade {
    pub trade_id: u64,
    pub event_ts_us: i64,
    pub price: f64,
    pub size: f64,
    pub buyer_is_maker: bool,
}

/// Request/response interface the re-anchor coordinator depends on.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fresh order-book snapshot with at least the retained depth per side.
    async fn depth_snapshot(&self, symbol: &str) -> Result<DepthSnapshot, SnapshotError>;

    /// Trades from `from_ts_us` onward, oldest first.
    async fn recent_trades(
        &self,
        symbol: &str,
        from_ts_us: i64,
    ) -> Result<Vec<SnapshotTrade>, SnapshotError>;
}

// ---------------------------------------------------------------------------
// REST implementation
// ---------------------------------------------------------------------------

/// Depth levels requested per side; comfortably above the retained depth.
const DEPTH_LIMIT: u32 = 100;
/// Max trades fetched per recent-trades request.
const TRADES_LIMIT: u32 = 1_000;

/// Public REST snapshot client.
pub struct RestSnapshotClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestSnapshotClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value, SnapshotError> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                SnapshotError::Timeout
            } else {
                SnapshotError::Transient(format!("request failed: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                429 | 418 => SnapshotError::Throttled,
                404 => SnapshotError::NotFound,
                s if (500..600).contains(&s) => {
                    SnapshotError::Transient(format!("server returned {status}"))
                }
                _ => SnapshotError::Permanent(format!("server returned {status}")),
            });
        }

        resp.json::<Value>()
            .await
            .map_err(|e| SnapshotError::Transient(format!("failed to parse response: {e}")))
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &Value, name: &str) -> Result<f64, SnapshotError> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .map_err(|_| SnapshotError::Transient(format!("field {name} not an f64: {s}")))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            Err(SnapshotError::Transient(format!(
                "field {name} has unexpected JSON type"
            )))
        }
    }

    fn parse_levels(raw: &Value, name: &str) -> Result<Vec<(f64, f64)>, SnapshotError> {
        let arr = raw
            .as_array()
            .ok_or_else(|| SnapshotError::Transient(format!("missing field {name}")))?;

        let mut levels = Vec::with_capacity(arr.len());
        for entry in arr {
            let pair = entry
                .as_array()
                .ok_or_else(|| SnapshotError::Transient(format!("{name} entry not an array")))?;
            if pair.len() < 2 {
                return Err(SnapshotError::Transient(format!("{name} entry too short")));
            }
            let price = Self::parse_str_f64(&pair[0], name)?;
            let size = Self::parse_str_f64(&pair[1], name)?;
            levels.push((price, size));
        }
        Ok(levels)
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotClient {
    #[instrument(skip(self), name = "snapshot::depth")]
    async fn depth_snapshot(&self, symbol: &str) -> Result<DepthSnapshot, SnapshotError> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url, symbol, DEPTH_LIMIT
        );

        let body = self.get_json(&url).await?;

        let update_id = body["lastUpdateId"]
            .as_u64()
            .ok_or_else(|| SnapshotError::Transient("missing field lastUpdateId".into()))?;

        let bids = Self::parse_levels(&body["bids"], "bids")?;
        let asks = Self::parse_levels(&body["asks"], "asks")?;

        // The depth endpoint carries no server timestamp; stamp receipt time.
        let server_ts_us = chrono::Utc::now().timestamp_micros();

        debug!(
            symbol,
            update_id,
            bid_levels = bids.len(),
            ask_levels = asks.len(),
            "depth snapshot fetched"
        );

        Ok(DepthSnapshot {
            bids,
            asks,
            update_id,
            server_ts_us,
        })
    }

    #[instrument(skip(self), name = "snapshot::trades")]
    async fn recent_trades(
        &self,
        symbol: &str,
        from_ts_us: i64,
    ) -> Result<Vec<SnapshotTrade>, SnapshotError> {
        let from_ms = (from_ts_us / 1_000).max(0);
        let url = format!(
            "{}/api/v3/aggTrades?symbol={}&startTime={}&limit={}",
            self.base_url, symbol, from_ms, TRADES_LIMIT
        );

        let body = self.get_json(&url).await?;

        let raw = body
            .as_array()
            .ok_or_else(|| SnapshotError::Transient("trades response is not an array".into()))?;

        let mut trades = Vec::with_capacity(raw.len());
        for entry in raw {
            let trade_id = entry["a"]
                .as_u64()
                .ok_or_else(|| SnapshotError::Transient("missing field a".into()))?;
            let price = Self::parse_str_f64(&entry["p"], "p")?;
            let size = Self::parse_str_f64(&entry["q"], "q")?;
            let ts_ms = entry["T"]
                .as_i64()
                .ok_or_else(|| SnapshotError::Transient("missing field T".into()))?;
            let buyer_is_maker = entry["m"]
                .as_bool()
                .ok_or_else(|| SnapshotError::Transient("missing field m".into()))?;

            trades.push(SnapshotTrade {
                trade_id,
                event_ts_us: ts_ms * 1_000,
                price,
                size,
                buyer_is_maker,
            });
        }

        trades.sort_by_key(|t| t.event_ts_us);

        debug!(symbol, count = trades.len(), "recent trades fetched");
        Ok(trades)
    }
}
