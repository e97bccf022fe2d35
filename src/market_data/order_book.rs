// =============================================================================
// Order Book — top-N snapshot with incremental depth maintenance
// =============================================================================
//
// The book keeps up to `max_levels` levels per side, bids descending and asks
// ascending, plus the derived aggregates the feature vector reads (value
// sums, imbalance, weighted mid). Depth diffs are applied incrementally;
// replays are ignored by update-id and continuity violations are surfaced to
// the caller as a gap outcome, never acted on here.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::types::{BestBidAskEvent, DepthDiffEvent, LevelDelta};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One resting price level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Result of applying a depth diff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DepthApplyOutcome {
    /// Diff applied; `last_update_id` advanced.
    Applied,
    /// Replay of an already-applied range; book unchanged.
    StaleIgnored,
    /// Update-id continuity violated. The diff was still applied best-effort;
    /// the caller forwards the hint to the gap detector.
    Gap { expected: u64, got: u64 },
}

/// Top-of-book snapshot plus derived aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    /// Bid levels, price descending.
    pub bids: Vec<BookLevel>,
    /// Ask levels, price ascending.
    pub asks: Vec<BookLevel>,
    /// Sum of price * size over retained bid levels.
    pub bid_value_sum: f64,
    /// Sum of price * size over retained ask levels.
    pub ask_value_sum: f64,
    /// (bid_value - ask_value) / (bid_value + ask_value), in [-1, 1].
    pub imbalance: Option<f64>,
    /// Size-weighted mid of the best quotes.
    pub weighted_mid: Option<f64>,
    pub last_trade_price: Option<f64>,
    /// Event time of the most recent book update, microseconds.
    pub ts_us: i64,
    /// Monotonic depth update id; only a re-anchor may move it backwards.
    pub last_update_id: u64,
    max_levels: usize,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>, max_levels: usize) -> Self {
        Self {
            symbol: symbol.into(),
            bids: Vec::with_capacity(max_levels),
            asks: Vec::with_capacity(max_levels),
            bid_value_sum: 0.0,
            ask_value_sum: 0.0,
            imbalance: None,
            weighted_mid: None,
            last_trade_price: None,
            ts_us: 0,
            last_update_id: 0,
            max_levels,
        }
    }

    /// Build a book from an authoritative depth snapshot.
    pub fn from_snapshot(
        symbol: impl Into<String>,
        bids: &[(f64, f64)],
        asks: &[(f64, f64)],
        update_id: u64,
        ts_us: i64,
        max_levels: usize,
    ) -> Self {
        let mut book = Self::new(symbol, max_levels);
        book.bids = bids
            .iter()
            .filter(|(_, sz)| *sz > 0.0)
            .map(|&(price, size)| BookLevel { price, size })
            .collect();
        book.asks = asks
            .iter()
            .filter(|(_, sz)| *sz > 0.0)
            .map(|&(price, size)| BookLevel { price, size })
            .collect();
        book.last_update_id = update_id;
        book.ts_us = ts_us;
        book.normalize();
        book
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }

    /// Arithmetic mid of the best quotes.
    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        }
    }

    /// Spread in basis points, relative to the best bid.
    pub fn spread_bp(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) if b.price > 0.0 => {
                Some(((a.price - b.price) / b.price) * 10_000.0)
            }
            _ => None,
        }
    }

    pub fn is_two_sided(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    // ── Mutation ────────────────────────────────────────────────────────

    /// Apply a top-of-book quote update. Deeper levels that the new quotes
    /// cross are dropped so the ladder stays monotonic.
    pub fn apply_best_bid_ask(&mut self, ev: &BestBidAskEvent) {
        // Remove any stale levels at or above the new best bid / at or below
        // the new best ask, then install the quotes as level zero.
        self.bids.retain(|l| l.price < ev.bid_px);
        self.asks.retain(|l| l.price > ev.ask_px);

        if ev.bid_sz > 0.0 {
            self.bids.insert(
                0,
                BookLevel {
                    price: ev.bid_px,
                    size: ev.bid_sz,
                },
            );
        }
        if ev.ask_sz > 0.0 {
            self.asks.insert(
                0,
                BookLevel {
                    price: ev.ask_px,
                    size: ev.ask_sz,
                },
            );
        }

        self.ts_us = self.ts_us.max(ev.event_ts_us);
        self.normalize();
    }

    /// Apply an incremental depth diff.
    ///
    /// Replays (`first_update_id <= last_update_id`) leave the book unchanged.
    /// A continuity violation (`first_update_id > last_update_id + 1` on an
    /// initialised book) is reported as [`DepthApplyOutcome::Gap`]; the diff
    /// is still applied so the book tracks the stream until the re-anchor
    /// lands.
    pub fn apply_depth_diff(&mut self, ev: &DepthDiffEvent) -> DepthApplyOutcome {
        if ev.first_update_id <= self.last_update_id {
            return DepthApplyOutcome::StaleIgnored;
        }

        let gap = if self.last_update_id > 0 && ev.first_update_id > self.last_update_id + 1 {
            Some((self.last_update_id + 1, ev.first_update_id))
        } else {
            None
        };

        Self::apply_side(&mut self.bids, &ev.bids);
        Self::apply_side(&mut self.asks, &ev.asks);

        self.last_update_id = ev.final_update_id;
        self.ts_us = self.ts_us.max(ev.event_ts_us);
        self.normalize();

        match gap {
            Some((expected, got)) => DepthApplyOutcome::Gap { expected, got },
            None => DepthApplyOutcome::Applied,
        }
    }

    pub fn set_last_trade_price(&mut self, price: f64, ts_us: i64) {
        self.last_trade_price = Some(price);
        self.ts_us = self.ts_us.max(ts_us);
    }

    fn apply_side(levels: &mut Vec<BookLevel>, deltas: &[LevelDelta]) {
        for delta in deltas {
            match levels.iter_mut().find(|l| l.price == delta.price) {
                Some(level) if delta.size == 0.0 => level.size = 0.0,
                Some(level) => level.size = delta.size,
                None if delta.size > 0.0 => levels.push(BookLevel {
                    price: delta.price,
                    size: delta.size,
                }),
                None => {} // removal of an unknown level
            }
        }
        levels.retain(|l| l.size > 0.0);
    }

    /// Restore side ordering, truncate to the retained depth, and recompute
    /// the derived aggregates.
    fn normalize(&mut self) {
        self.bids
            .sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        self.asks
            .sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        self.bids.dedup_by(|a, b| a.price == b.price);
        self.asks.dedup_by(|a, b| a.price == b.price);
        self.bids.truncate(self.max_levels);
        self.asks.truncate(self.max_levels);

        self.bid_value_sum = self.bids.iter().map(|l| l.price * l.size).sum();
        self.ask_value_sum = self.asks.iter().map(|l| l.price * l.size).sum();

        let total = self.bid_value_sum + self.ask_value_sum;
        self.imbalance = if total > 0.0 {
            Some((self.bid_value_sum - self.ask_value_sum) / total)
        } else {
            None
        };

        self.weighted_mid = match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) if b.size + a.size > 0.0 => {
                // Microprice: each quote weighted by the opposite side's size.
                Some((b.price * a.size + a.price * b.size) / (b.size + a.size))
            }
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        };
    }

    // ── Validation ──────────────────────────────────────────────────────

    /// Verify the book invariants. Used on shadow bundles before substitute
    /// and available to tests.
    pub fn validate(&self) -> Result<()> {
        if self.bids.is_empty() || self.asks.is_empty() {
            bail!("book is one-sided ({} bids, {} asks)", self.bids.len(), self.asks.len());
        }

        let best_bid = self.bids[0].price;
        let best_ask = self.asks[0].price;
        if best_ask <= best_bid {
            bail!("crossed book: best_ask {best_ask} <= best_bid {best_bid}");
        }

        for pair in self.bids.windows(2) {
            if pair[1].price >= pair[0].price {
                bail!("bid ladder not strictly descending at price {}", pair[1].price);
            }
        }
        for pair in self.asks.windows(2) {
            if pair[1].price <= pair[0].price {
                bail!("ask ladder not strictly ascending at price {}", pair[1].price);
            }
        }

        for l in self.bids.iter().chain(self.asks.iter()) {
            if !(l.price.is_finite() && l.size.is_finite()) || l.size < 0.0 {
                bail!("invalid level price={} size={}", l.price, l.size);
            }
        }

        for v in [self.bid_value_sum, self.ask_value_sum] {
            if !v.is_finite() {
                bail!("non-finite value sum");
            }
        }
        if let Some(im) = self.imbalance {
            if !im.is_finite() {
                bail!("non-finite imbalance");
            }
        }
        if let Some(wm) = self.weighted_mid {
            if !wm.is_finite() {
                bail!("non-finite weighted mid");
            }
        }

        Ok(())
    }
}
