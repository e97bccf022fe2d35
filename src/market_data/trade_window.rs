// =============================================================================
// Rolling Trade Window — incremental statistics over (now - w, now]
// =============================================================================
//
// The window is an ordered ring of trades keyed by event time. Sums (count,
// volume, notional, buy/sell split) are maintained incrementally: added on
// append, subtracted on eviction. Higher moments (price std, intertrade
// arrival mean/variance) use Welford updates on append and are rebuilt from
// the retained ring on eviction, since exactly backing out a moment is
// numerically unsafe and the rings are small.
//
// An empty window is a first-class state: VWAP and its derivatives are `None`,
// never NaN.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One trade retained by a window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowTrade {
    pub ts_us: i64,
    pub price: f64,
    pub size: f64,
    pub is_taker_buy: bool,
}

impl WindowTrade {
    pub fn notional(&self) -> f64 {
        self.price * self.size
    }
}

/// Derived statistics published into the hot state. Plain data, cheap to clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeStats {
    pub window_ms: u64,
    pub count: u64,
    pub volume: f64,
    pub notional: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub buy_notional: f64,
    pub sell_notional: f64,
    /// buy_volume - sell_volume.
    pub signed_volume: f64,
    /// notional / volume; `None` marks the empty window.
    pub vwap: Option<f64>,
    /// vwap - current book mid, when both exist.
    pub vwap_mid_deviation: Option<f64>,
    /// Population standard deviation of trade prices.
    pub price_std: Option<f64>,
    /// Mean gap between consecutive trades, microseconds.
    pub intertrade_mean_us: Option<f64>,
    /// Population variance of intertrade gaps.
    pub intertrade_var_us: Option<f64>,
    /// Trades per second over the window length.
    pub intensity: f64,
    pub avg_trade_size: Option<f64>,
    /// Event time the window currently ends at.
    pub window_end_ts_us: i64,
}

impl TradeStats {
    /// The designated empty-window marker.
    pub fn empty(window_ms: u64, window_end_ts_us: i64) -> Self {
        Self {
            window_ms,
            count: 0,
            volume: 0.0,
            notional: 0.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            buy_notional: 0.0,
            sell_notional: 0.0,
            signed_volume: 0.0,
            vwap: None,
            vwap_mid_deviation: None,
            price_std: None,
            intertrade_mean_us: None,
            intertrade_var_us: None,
            intensity: 0.0,
            avg_trade_size: None,
            window_end_ts_us,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// ---------------------------------------------------------------------------
// TradeWindow
// ---------------------------------------------------------------------------

/// Maintains one rolling window of trades and its incremental accumulators.
#[derive(Debug, Clone)]
pub struct TradeWindow {
    window_us: i64,
    window_ms: u64,
    trades: VecDeque<WindowTrade>,

    volume: f64,
    notional: f64,
    buy_volume: f64,
    sell_volume: f64,
    buy_notional: f64,
    sell_notional: f64,

    // Welford accumulators over trade price.
    price_mean: f64,
    price_m2: f64,

    // Welford accumulators over intertrade gaps (µs).
    gap_count: u64,
    gap_mean: f64,
    gap_m2: f64,
}

impl TradeWindow {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_us: (window_ms as i64) * 1_000,
            window_ms,
            trades: VecDeque::new(),
            volume: 0.0,
            notional: 0.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            buy_notional: 0.0,
            sell_notional: 0.0,
            price_mean: 0.0,
            price_m2: 0.0,
            gap_count: 0,
            gap_mean: 0.0,
            gap_m2: 0.0,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// Iterate the retained trades, oldest first.
    pub fn trades(&self) -> impl Iterator<Item = &WindowTrade> {
        self.trades.iter()
    }

    /// Evict trades whose event time has fallen out of `(now - w, now]`.
    pub fn advance(&mut self, now_us: i64) {
        let cutoff = now_us - self.window_us;
        let mut evicted = false;

        while let Some(front) = self.trades.front() {
            if front.ts_us <= cutoff {
                let t = self.trades.pop_front().expect("front checked above");
                self.volume -= t.size;
                self.notional -= t.notional();
                if t.is_taker_buy {
                    self.buy_volume -= t.size;
                    self.buy_notional -= t.notional();
                } else {
                    self.sell_volume -= t.size;
                    self.sell_notional -= t.notional();
                }
                evicted = true;
            } else {
                break;
            }
        }

        if evicted {
            self.clamp_sums();
            self.rebuild_moments();
        }
    }

    /// Append one trade. Caller guarantees event-time ordering; the window
    /// tolerates equal timestamps.
    pub fn push(&mut self, trade: WindowTrade) {
        if let Some(last) = self.trades.back() {
            let gap = (trade.ts_us - last.ts_us).max(0) as f64;
            self.gap_count += 1;
            let delta = gap - self.gap_mean;
            self.gap_mean += delta / self.gap_count as f64;
            self.gap_m2 += delta * (gap - self.gap_mean);
        }

        let n = self.trades.len() as f64 + 1.0;
        let delta = trade.price - self.price_mean;
        self.price_mean += delta / n;
        self.price_m2 += delta * (trade.price - self.price_mean);

        self.volume += trade.size;
        self.notional += trade.notional();
        if trade.is_taker_buy {
            self.buy_volume += trade.size;
            self.buy_notional += trade.notional();
        } else {
            self.sell_volume += trade.size;
            self.sell_notional += trade.notional();
        }

        self.trades.push_back(trade);
    }

    /// Rebuild the window from scratch (re-anchor adoption).
    pub fn reset_from(&mut self, trades: &[WindowTrade], now_us: i64) {
        self.trades.clear();
        self.volume = 0.0;
        self.notional = 0.0;
        self.buy_volume = 0.0;
        self.sell_volume = 0.0;
        self.buy_notional = 0.0;
        self.sell_notional = 0.0;
        self.price_mean = 0.0;
        self.price_m2 = 0.0;
        self.gap_count = 0;
        self.gap_mean = 0.0;
        self.gap_m2 = 0.0;

        let cutoff = now_us - self.window_us;
        let mut sorted: Vec<WindowTrade> = trades
            .iter()
            .copied()
            .filter(|t| t.ts_us > cutoff && t.ts_us <= now_us)
            .collect();
        sorted.sort_by_key(|t| t.ts_us);

        for t in sorted {
            self.push(t);
        }
    }

    /// Derive the publishable statistics at `now_us`, using `mid` for the
    /// VWAP deviation when the book has one.
    pub fn stats(&self, now_us: i64, mid: Option<f64>) -> TradeStats {
        let count = self.trades.len() as u64;
        if count == 0 {
            return TradeStats::empty(self.window_ms, now_us);
        }

        let vwap = if self.volume > 0.0 {
            Some(self.notional / self.volume)
        } else {
            None
        };

        let vwap_mid_deviation = match (vwap, mid) {
            (Some(v), Some(m)) => Some(v - m),
            _ => None,
        };

        let price_std = Some((self.price_m2 / count as f64).max(0.0).sqrt());

        let (intertrade_mean_us, intertrade_var_us) = if self.gap_count > 0 {
            (
                Some(self.gap_mean),
                Some((self.gap_m2 / self.gap_count as f64).max(0.0)),
            )
        } else {
            (None, None)
        };

        let window_secs = self.window_us as f64 / 1_000_000.0;

        TradeStats {
            window_ms: self.window_ms,
            count,
            volume: self.volume,
            notional: self.notional,
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            buy_notional: self.buy_notional,
            sell_notional: self.sell_notional,
            signed_volume: self.buy_volume - self.sell_volume,
            vwap,
            vwap_mid_deviation,
            price_std,
            intertrade_mean_us,
            intertrade_var_us,
            intensity: count as f64 / window_secs,
            avg_trade_size: Some(self.volume / count as f64),
            window_end_ts_us: now_us,
        }
    }

    /// Incremental subtraction can leave tiny negative residue on an empty
    /// window; snap it back to exactly zero.
    fn clamp_sums(&mut self) {
        if self.trades.is_empty() {
            self.volume = 0.0;
            self.notional = 0.0;
            self.buy_volume = 0.0;
            self.sell_volume = 0.0;
            self.buy_notional = 0.0;
            self.sell_notional = 0.0;
        }
    }

    fn rebuild_moments(&mut self) {
        self.price_mean = 0.0;
        self.price_m2 = 0.0;
        self.gap_count = 0;
        self.gap_mean = 0.0;
        self.gap_m2 = 0.0;

        let mut prev_ts: Option<i64> = None;
        let mut n = 0.0;
        for t in &self.trades {
            n += 1.0;
            let delta = t.price - self.price_mean;
            self.price_mean += delta / n;
            self.price_m2 += delta * (t.price - self.price_mean);

            if let Some(prev) = prev_ts {
                let gap = (t.ts_us - prev).max(0) as f64;
                self.gap_count += 1;
                let d = gap - self.gap_mean;
                self.gap_mean += d / self.gap_count as f64;
                self.gap_m2 += d * (gap - self.gap_mean);
            }
            prev_ts = Some(t.ts_us);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ts_us: i64, price: f64, size: f64, is_taker_buy: bool) -> WindowTrade {
        WindowTrade {
            ts_us,
            price,
            size,
            is_taker_buy,
        }
    }

    /// Brute-force reference over the same trade subset.
    fn reference_sums(trades: &[WindowTrade], now_us: i64, window_us: i64) -> (u64, f64, f64, f64) {
        let in_window: Vec<&WindowTrade> = trades
            .iter()
            .filter(|t| t.ts_us > now_us - window_us && t.ts_us <= now_us)
            .collect();
        let count = in_window.len() as u64;
        let volume: f64 = in_window.iter().map(|t| t.size).sum();
        let notional: f64 = in_window.iter().map(|t| t.notional()).sum();
        let signed: f64 = in_window
            .iter()
            .map(|t| if t.is_taker_buy { t.size } else { -t.size })
            .sum();
        (count, volume, notional, signed)
    }

    #[test]
    fn scenario_two_trades_in_one_second_window() {
        let mut w = TradeWindow::new(1_000);
        w.advance(1_100_000);
        w.push(trade(1_100_000, 100.01, 0.5, true)); // buyer_maker=false -> taker buy
        w.advance(1_200_000);
        w.push(trade(1_200_000, 100.02, 0.3, false)); // buyer_maker=true -> taker sell

        let stats = w.stats(1_200_000, Some(100.01));
        assert_eq!(stats.count, 2);
        assert!((stats.volume - 0.8).abs() < 1e-12);
        assert!((stats.signed_volume - 0.2).abs() < 1e-12);
        let expected_vwap = (100.01 * 0.5 + 100.02 * 0.3) / 0.8;
        assert!((stats.vwap.unwrap() - expected_vwap).abs() < 1e-9);
        assert!((stats.vwap.unwrap() - 100.01375).abs() < 1e-9);
    }

    #[test]
    fn eviction_matches_reference_over_synthetic_stream() {
        let window_us = 1_000_000;
        let mut w = TradeWindow::new(1_000);
        let mut all: Vec<WindowTrade> = Vec::new();

        // 40 trades spaced 100ms apart with varying sizes and sides.
        for i in 0..40i64 {
            let t = trade(
                1_000_000 + i * 100_000,
                100.0 + (i % 7) as f64 * 0.01,
                0.1 + (i % 3) as f64 * 0.05,
                i % 2 == 0,
            );
            all.push(t);
            w.advance(t.ts_us);
            w.push(t);

            let (count, volume, notional, signed) = reference_sums(&all, t.ts_us, window_us);
            let stats = w.stats(t.ts_us, None);
            assert_eq!(stats.count, count, "at trade {i}");
            assert!((stats.volume - volume).abs() < 1e-9, "at trade {i}");
            assert!((stats.notional - notional).abs() < 1e-6, "at trade {i}");
            assert!((stats.signed_volume - signed).abs() < 1e-9, "at trade {i}");
        }
    }

    #[test]
    fn boundary_is_half_open() {
        // Window (now - w, now]: a trade exactly w old is evicted.
        let mut w = TradeWindow::new(1_000);
        w.push(trade(1_000_000, 100.0, 1.0, true));
        w.advance(2_000_000);
        assert!(w.is_empty());

        let mut w = TradeWindow::new(1_000);
        w.push(trade(1_000_001, 100.0, 1.0, true));
        w.advance(2_000_000);
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn empty_window_is_marked_not_nan() {
        let w = TradeWindow::new(1_000);
        let stats = w.stats(5_000_000, Some(100.0));
        assert!(stats.is_empty());
        assert_eq!(stats.vwap, None);
        assert_eq!(stats.vwap_mid_deviation, None);
        assert_eq!(stats.price_std, None);
        assert_eq!(stats.avg_trade_size, None);
        assert_eq!(stats.volume, 0.0);
        assert_eq!(stats.intensity, 0.0);
    }

    #[test]
    fn drained_window_resets_to_empty_marker() {
        let mut w = TradeWindow::new(1_000);
        w.push(trade(1_000_000, 100.0, 1.0, true));
        w.push(trade(1_100_000, 101.0, 2.0, false));
        w.advance(10_000_000);
        let stats = w.stats(10_000_000, None);
        assert!(stats.is_empty());
        assert_eq!(stats.volume, 0.0);
        assert_eq!(stats.vwap, None);
    }

    #[test]
    fn price_std_rebuilt_after_eviction() {
        let mut w = TradeWindow::new(1_000);
        w.push(trade(1_000_000, 100.0, 1.0, true));
        w.push(trade(1_400_000, 110.0, 1.0, true));
        w.push(trade(1_900_000, 102.0, 1.0, true));
        // Evict the first two; only the 102.0 trade remains.
        w.advance(2_800_000);
        let stats = w.stats(2_800_000, None);
        assert_eq!(stats.count, 1);
        assert!((stats.price_std.unwrap() - 0.0).abs() < 1e-12);
        assert_eq!(stats.intertrade_mean_us, None);
    }

    #[test]
    fn intertrade_gap_stats() {
        let mut w = TradeWindow::new(5_000);
        w.push(trade(1_000_000, 100.0, 1.0, true));
        w.push(trade(1_200_000, 100.0, 1.0, true));
        w.push(trade(1_600_000, 100.0, 1.0, true));
        let stats = w.stats(1_600_000, None);
        // Gaps: 200_000 and 400_000 -> mean 300_000, population var 1e10.
        assert!((stats.intertrade_mean_us.unwrap() - 300_000.0).abs() < 1e-6);
        assert!((stats.intertrade_var_us.unwrap() - 1.0e10).abs() < 1e-2);
    }

    #[test]
    fn reset_from_keeps_only_in_window_trades() {
        let mut w = TradeWindow::new(5_000);
        let trades = vec![
            trade(1_000_000, 100.0, 1.0, true),
            trade(4_000_000, 101.0, 1.0, false),
            trade(6_000_000, 102.0, 1.0, true),
        ];
        w.reset_from(&trades, 7_000_000);
        // Window (2s, 7s]: first trade excluded.
        assert_eq!(w.len(), 2);
        let stats = w.stats(7_000_000, None);
        assert!((stats.volume - 2.0).abs() < 1e-12);
        assert!((stats.signed_volume - 0.0).abs() < 1e-12);
    }

    #[test]
    fn buy_sell_split_follows_taker_side() {
        let mut w = TradeWindow::new(5_000);
        w.push(trade(1_000_000, 100.0, 0.5, true));
        w.push(trade(1_100_000, 100.0, 0.3, false));
        let stats = w.stats(1_100_000, None);
        assert!((stats.buy_volume - 0.5).abs() < 1e-12);
        assert!((stats.sell_volume - 0.3).abs() < 1e-12);
        assert!((stats.buy_notional - 50.0).abs() < 1e-9);
        assert!((stats.sell_notional - 30.0).abs() < 1e-9);
    }
}
