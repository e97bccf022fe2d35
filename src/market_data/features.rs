// =============================================================================
// Feature Vector — the fixed-shape model input derived from hot state
// =============================================================================
//
// Exactly one feature vector exists per hot-state revision. Fields that can
// be unavailable (no trades yet, one-sided book) are `Option<f64>`; a `Some`
// value is always finite. The completeness ratio counts non-missing fields
// against the full shape, and downstream confidence scales with it.
//
// `MODEL_FEATURES` is the canonical model-input order; the model artifact
// must list the same names in the same order or startup fails.

use std::collections::VecDeque;

use chrono::{TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::order_book::OrderBook;
use super::trade_window::TradeStats;

// ---------------------------------------------------------------------------
// Canonical feature order
// ---------------------------------------------------------------------------

/// Model-input order. The scaler and weights in the model artifact are
/// indexed by this list.
pub const MODEL_FEATURES: &[&str] = &[
    "price",
    "mid",
    "return_1s",
    "return_5s",
    "return_10s",
    "volume_1s",
    "volume_5s",
    "signed_volume_1s",
    "signed_volume_5s",
    "vwap_dev_1s",
    "vwap_dev_5s",
    "spread_bp",
    "book_imbalance",
    "bid_strength",
    "ask_strength",
    "trade_intensity_1s",
    "avg_trade_size_1s",
    "volatility",
    "momentum",
    "hour_sin",
    "hour_cos",
    "session_asia",
    "session_europe",
    "session_us",
    "imbalance_x_intensity",
    "spread_x_volatility",
    "signed_volume_x_momentum",
];

/// Total feature count, the completeness denominator.
pub const TOTAL_FEATURES: usize = MODEL_FEATURES.len();

// ---------------------------------------------------------------------------
// Mid-price history
// ---------------------------------------------------------------------------

/// Retention beyond the longest return horizon.
const HISTORY_RETENTION_US: i64 = 16_000_000;

/// Small ring of (event time, mid) samples the aggregator keeps privately to
/// compute returns over 1/5/10 s horizons.
#[derive(Debug, Clone, Default)]
pub struct MidHistory {
    samples: VecDeque<(i64, f64)>,
}

impl MidHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ts_us: i64, mid: f64) {
        if let Some(&(last_ts, _)) = self.samples.back() {
            if ts_us < last_ts {
                return; // out-of-order sample, keep the ring monotonic
            }
        }
        self.samples.push_back((ts_us, mid));
        let cutoff = ts_us - HISTORY_RETENTION_US;
        while let Some(&(ts, _)) = self.samples.front() {
            if ts < cutoff && self.samples.len() > 1 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Latest sample at or before `ts_us`; falls back to the oldest retained
    /// sample when the horizon predates the history.
    pub fn mid_at_or_before(&self, ts_us: i64) -> Option<f64> {
        let mut best: Option<f64> = None;
        for &(ts, mid) in &self.samples {
            if ts <= ts_us {
                best = Some(mid);
            } else {
                break;
            }
        }
        best.or_else(|| self.samples.front().map(|&(_, m)| m))
    }
}

// ---------------------------------------------------------------------------
// FeatureVector
// ---------------------------------------------------------------------------

/// Fixed-shape model input. `None` marks a missing feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub price: Option<f64>,
    pub mid: Option<f64>,
    pub return_1s: Option<f64>,
    pub return_5s: Option<f64>,
    pub return_10s: Option<f64>,
    pub volume_1s: Option<f64>,
    pub volume_5s: Option<f64>,
    pub signed_volume_1s: Option<f64>,
    pub signed_volume_5s: Option<f64>,
    pub vwap_dev_1s: Option<f64>,
    pub vwap_dev_5s: Option<f64>,
    pub spread_bp: Option<f64>,
    pub book_imbalance: Option<f64>,
    pub bid_strength: Option<f64>,
    pub ask_strength: Option<f64>,
    pub trade_intensity_1s: Option<f64>,
    pub avg_trade_size_1s: Option<f64>,
    pub volatility: Option<f64>,
    pub momentum: Option<f64>,

    // Temporal encodings, always present.
    pub hour_sin: f64,
    pub hour_cos: f64,
    pub session_asia: f64,
    pub session_europe: f64,
    pub session_us: f64,

    // Interaction set.
    pub imbalance_x_intensity: Option<f64>,
    pub spread_x_volatility: Option<f64>,
    pub signed_volume_x_momentum: Option<f64>,

    /// (TOTAL_FEATURES - missing) / TOTAL_FEATURES, in [0, 1].
    pub completeness: f64,
    /// Wall-clock age of the newest underlying input, milliseconds.
    pub data_age_ms: i64,
    /// Wall-clock time this vector was computed, milliseconds.
    pub ts_ms: i64,
}

impl FeatureVector {
    /// Vector with no market inputs: only the temporal encodings are present.
    pub fn empty(now_ms: i64) -> Self {
        let (hour_sin, hour_cos, asia, europe, us) = temporal_encodings(now_ms);
        let mut fv = Self {
            price: None,
            mid: None,
            return_1s: None,
            return_5s: None,
            return_10s: None,
            volume_1s: None,
            volume_5s: None,
            signed_volume_1s: None,
            signed_volume_5s: None,
            vwap_dev_1s: None,
            vwap_dev_5s: None,
            spread_bp: None,
            book_imbalance: None,
            bid_strength: None,
            ask_strength: None,
            trade_intensity_1s: None,
            avg_trade_size_1s: None,
            volatility: None,
            momentum: None,
            hour_sin,
            hour_cos,
            session_asia: asia,
            session_europe: europe,
            session_us: us,
            imbalance_x_intensity: None,
            spread_x_volatility: None,
            signed_volume_x_momentum: None,
            completeness: 0.0,
            data_age_ms: now_ms,
            ts_ms: now_ms,
        };
        fv.completeness = fv.compute_completeness();
        fv
    }

    /// Derive the full vector from the current book, the two windows and the
    /// mid history. Pure: no state is mutated.
    pub fn compute(
        book: &OrderBook,
        ts_1s: &TradeStats,
        ts_5s: &TradeStats,
        history: &MidHistory,
        now_ms: i64,
    ) -> Self {
        let now_us = now_ms * 1_000;
        let mid = book.mid();
        let price = book.last_trade_price;

        let ret = |horizon_us: i64| -> Option<f64> {
            let mid_now = mid?;
            let mid_then = history.mid_at_or_before(now_us - horizon_us)?;
            if mid_then > 0.0 {
                Some(mid_now / mid_then - 1.0)
            } else {
                None
            }
        };

        let return_1s = ret(1_000_000);
        let return_5s = ret(5_000_000);
        let return_10s = ret(10_000_000);

        // Sums over an empty window are true zeros; only VWAP-derived values
        // and the price moments carry the empty marker.
        let volume_1s = Some(ts_1s.volume);
        let volume_5s = Some(ts_5s.volume);
        let signed_volume_1s = Some(ts_1s.signed_volume);
        let signed_volume_5s = Some(ts_5s.signed_volume);
        let trade_intensity_1s = Some(ts_1s.intensity);
        let vwap_dev_1s = ts_1s.vwap_mid_deviation;
        let vwap_dev_5s = ts_5s.vwap_mid_deviation;
        let avg_trade_size_1s = ts_1s.avg_trade_size;
        let volatility = ts_5s.price_std;

        let total_value = book.bid_value_sum + book.ask_value_sum;
        let (bid_strength, ask_strength) = if total_value > 0.0 {
            (
                Some(book.bid_value_sum / total_value),
                Some(book.ask_value_sum / total_value),
            )
        } else {
            (None, None)
        };

        let momentum = match (return_1s, return_5s) {
            (Some(r1), Some(r5)) => Some(r1 - r5),
            _ => None,
        };

        let spread_bp = book.spread_bp();
        let book_imbalance = book.imbalance;

        // Interactions inherit the missing marker from their book-side term;
        // a missing trade-side term is imputed as zero.
        let imbalance_x_intensity = match (book_imbalance, trade_intensity_1s) {
            (Some(i), Some(t)) => Some(i * t),
            _ => None,
        };
        let spread_x_volatility =
            spread_bp.map(|s| s * volatility.unwrap_or(0.0));
        let signed_volume_x_momentum = match (signed_volume_1s, momentum) {
            (Some(sv), Some(m)) => Some(sv * m),
            _ => None,
        };

        let (hour_sin, hour_cos, asia, europe, us) = temporal_encodings(now_ms);

        let newest_input_us = book.ts_us.max(ts_1s.window_end_ts_us);
        let data_age_ms = if newest_input_us > 0 {
            (now_ms - newest_input_us / 1_000).max(0)
        } else {
            now_ms
        };

        let mut fv = Self {
            price,
            mid,
            return_1s,
            return_5s,
            return_10s,
            volume_1s,
            volume_5s,
            signed_volume_1s,
            signed_volume_5s,
            vwap_dev_1s,
            vwap_dev_5s,
            spread_bp,
            book_imbalance,
            bid_strength,
            ask_strength,
            trade_intensity_1s,
            avg_trade_size_1s,
            volatility,
            momentum,
            hour_sin,
            hour_cos,
            session_asia: asia,
            session_europe: europe,
            session_us: us,
            imbalance_x_intensity,
            spread_x_volatility,
            signed_volume_x_momentum,
            completeness: 0.0,
            data_age_ms,
            ts_ms: now_ms,
        };
        fv.completeness = fv.compute_completeness();
        fv
    }

    /// Count of missing (None) features in the fixed shape.
    pub fn missing_count(&self) -> usize {
        [
            self.price,
            self.mid,
            self.return_1s,
            self.return_5s,
            self.return_10s,
            self.volume_1s,
            self.volume_5s,
            self.signed_volume_1s,
            self.signed_volume_5s,
            self.vwap_dev_1s,
            self.vwap_dev_5s,
            self.spread_bp,
            self.book_imbalance,
            self.bid_strength,
            self.ask_strength,
            self.trade_intensity_1s,
            self.avg_trade_size_1s,
            self.volatility,
            self.momentum,
            self.imbalance_x_intensity,
            self.spread_x_volatility,
            self.signed_volume_x_momentum,
        ]
        .iter()
        .filter(|v| v.is_none())
        .count()
    }

    fn compute_completeness(&self) -> f64 {
        (TOTAL_FEATURES - self.missing_count()) as f64 / TOTAL_FEATURES as f64
    }

    /// Value of a named feature in the canonical order. Outer `None` means the
    /// name is unknown; inner `None` means the feature is missing right now.
    pub fn model_value(&self, name: &str) -> Option<Option<f64>> {
        let v = match name {
            "price" => self.price,
            "mid" => self.mid,
            "return_1s" => self.return_1s,
            "return_5s" => self.return_5s,
            "return_10s" => self.return_10s,
            "volume_1s" => self.volume_1s,
            "volume_5s" => self.volume_5s,
            "signed_volume_1s" => self.signed_volume_1s,
            "signed_volume_5s" => self.signed_volume_5s,
            "vwap_dev_1s" => self.vwap_dev_1s,
            "vwap_dev_5s" => self.vwap_dev_5s,
            "spread_bp" => self.spread_bp,
            "book_imbalance" => self.book_imbalance,
            "bid_strength" => self.bid_strength,
            "ask_strength" => self.ask_strength,
            "trade_intensity_1s" => self.trade_intensity_1s,
            "avg_trade_size_1s" => self.avg_trade_size_1s,
            "volatility" => self.volatility,
            "momentum" => self.momentum,
            "hour_sin" => Some(self.hour_sin),
            "hour_cos" => Some(self.hour_cos),
            "session_asia" => Some(self.session_asia),
            "session_europe" => Some(self.session_europe),
            "session_us" => Some(self.session_us),
            "imbalance_x_intensity" => self.imbalance_x_intensity,
            "spread_x_volatility" => self.spread_x_volatility,
            "signed_volume_x_momentum" => self.signed_volume_x_momentum,
            _ => return None,
        };
        Some(v)
    }

    /// All `Some` values must be finite; the publish path asserts this.
    pub fn all_finite(&self) -> bool {
        MODEL_FEATURES.iter().all(|name| {
            match self.model_value(name) {
                Some(Some(v)) => v.is_finite(),
                Some(None) => true,
                None => false,
            }
        })
    }
}

/// Hour-of-day sin/cos plus coarse UTC session flags.
fn temporal_encodings(now_ms: i64) -> (f64, f64, f64, f64, f64) {
    let dt = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
    let hour = dt.hour() as f64 + dt.minute() as f64 / 60.0;
    let angle = hour / 24.0 * std::f64::consts::TAU;

    let h = dt.hour();
    let asia = if h < 9 { 1.0 } else { 0.0 };
    let europe = if (7..16).contains(&h) { 1.0 } else { 0.0 };
    let us = if (13..22).contains(&h) { 1.0 } else { 0.0 };

    (angle.sin(), angle.cos(), asia, europe, us)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::trade_window::TradeWindow;
    use crate::market_data::WindowTrade;
    use crate::types::BestBidAskEvent;

    fn seeded_book() -> OrderBook {
        let mut book = OrderBook::new("BTCUSDT", 10);
        book.apply_best_bid_ask(&BestBidAskEvent {
            event_ts_us: 1_000_000,
            bid_px: 100.00,
            bid_sz: 1.0,
            ask_px: 100.02,
            ask_sz: 1.0,
            seq_id: 1,
        });
        book
    }

    fn trade(ts_us: i64, price: f64, size: f64, is_taker_buy: bool) -> WindowTrade {
        WindowTrade {
            ts_us,
            price,
            size,
            is_taker_buy,
        }
    }

    #[test]
    fn steady_state_vector_is_complete() {
        let mut book = seeded_book();
        book.set_last_trade_price(100.02, 1_200_000);

        let mut w1 = TradeWindow::new(1_000);
        let mut w5 = TradeWindow::new(5_000);
        for w in [&mut w1, &mut w5] {
            w.push(trade(1_100_000, 100.01, 0.5, true));
            w.push(trade(1_200_000, 100.02, 0.3, false));
        }

        let mut history = MidHistory::new();
        history.push(1_000_000, book.mid().unwrap());

        let mid = book.mid();
        let fv = FeatureVector::compute(
            &book,
            &w1.stats(1_200_000, mid),
            &w5.stats(1_200_000, mid),
            &history,
            2_000,
        );

        assert_eq!(fv.missing_count(), 0);
        assert!((fv.completeness - 1.0).abs() < 1e-12);
        assert_eq!(fv.price, Some(100.02));
        assert!((fv.mid.unwrap() - 100.01).abs() < 1e-9);
        assert!((fv.volume_1s.unwrap() - 0.8).abs() < 1e-12);
        assert!((fv.signed_volume_1s.unwrap() - 0.2).abs() < 1e-12);
        assert!((fv.spread_bp.unwrap() - 2.0).abs() < 1e-9);
        // VWAP deviation against mid: 100.01375 - 100.01
        assert!((fv.vwap_dev_1s.unwrap() - 0.00375).abs() < 1e-9);
        assert!(fv.all_finite());
    }

    #[test]
    fn quote_only_vector_marks_vwap_derived_features_missing() {
        let book = seeded_book();
        let w1 = TradeWindow::new(1_000);
        let w5 = TradeWindow::new(5_000);
        let mut history = MidHistory::new();
        history.push(1_000_000, book.mid().unwrap());

        let fv = FeatureVector::compute(
            &book,
            &w1.stats(3_000_000, book.mid()),
            &w5.stats(3_000_000, book.mid()),
            &history,
            3_000,
        );

        // Sums over an empty window are zeros, not missing.
        assert_eq!(fv.volume_1s, Some(0.0));
        assert_eq!(fv.signed_volume_1s, Some(0.0));
        assert_eq!(fv.trade_intensity_1s, Some(0.0));
        // Undefined-for-empty fields carry the marker.
        assert_eq!(fv.vwap_dev_1s, None);
        assert_eq!(fv.vwap_dev_5s, None);
        assert_eq!(fv.avg_trade_size_1s, None);
        assert_eq!(fv.volatility, None);
        assert_eq!(fv.price, None);
        assert_eq!(fv.missing_count(), 5);
        let expected = (TOTAL_FEATURES - 5) as f64 / TOTAL_FEATURES as f64;
        assert!((fv.completeness - expected).abs() < 1e-12);
        // Above the default 0.8 inference gate: the tick proceeds with
        // proportionally reduced confidence.
        assert!(fv.completeness >= 0.8);
        // Book-derived features are still present.
        assert!(fv.mid.is_some());
        assert!(fv.spread_bp.is_some());
        assert!(fv.book_imbalance.is_some());
    }

    #[test]
    fn empty_vector_has_only_temporal_features() {
        let fv = FeatureVector::empty(1_700_000_000_000);
        assert_eq!(fv.missing_count(), 22);
        let expected = (TOTAL_FEATURES - 22) as f64 / TOTAL_FEATURES as f64;
        assert!((fv.completeness - expected).abs() < 1e-12);
        assert!(fv.all_finite());
    }

    #[test]
    fn returns_use_oldest_sample_before_horizon_exists() {
        let book = seeded_book();
        let mut history = MidHistory::new();
        history.push(1_000_000, 100.01);

        let w1 = TradeWindow::new(1_000);
        let w5 = TradeWindow::new(5_000);
        let fv = FeatureVector::compute(
            &book,
            &w1.stats(1_200_000, book.mid()),
            &w5.stats(1_200_000, book.mid()),
            &history,
            2_000,
        );
        // Only one history sample: all returns collapse to zero but exist.
        assert_eq!(fv.return_10s, Some(0.0));
        assert_eq!(fv.return_1s, Some(0.0));
    }

    #[test]
    fn mid_history_lookup() {
        let mut h = MidHistory::new();
        h.push(1_000_000, 100.0);
        h.push(2_000_000, 101.0);
        h.push(3_000_000, 102.0);
        assert_eq!(h.mid_at_or_before(2_500_000), Some(101.0));
        assert_eq!(h.mid_at_or_before(3_000_000), Some(102.0));
        // Before the oldest sample: falls back to the oldest.
        assert_eq!(h.mid_at_or_before(500_000), Some(100.0));
    }

    #[test]
    fn mid_history_rejects_out_of_order() {
        let mut h = MidHistory::new();
        h.push(2_000_000, 101.0);
        h.push(1_000_000, 100.0);
        assert_eq!(h.mid_at_or_before(5_000_000), Some(101.0));
    }

    #[test]
    fn model_value_covers_canonical_order() {
        let fv = FeatureVector::empty(0);
        for name in MODEL_FEATURES {
            assert!(fv.model_value(name).is_some(), "unknown feature {name}");
        }
        assert!(fv.model_value("no_such_feature").is_none());
    }

    #[test]
    fn temporal_flags_by_hour() {
        // 2023-11-14 03:00 UTC -> Asia session.
        let (_, _, asia, europe, us) = temporal_encodings(1_699_930_800_000);
        assert_eq!(asia, 1.0);
        assert_eq!(europe, 0.0);
        assert_eq!(us, 0.0);

        // 14:00 UTC -> Europe + US overlap.
        let (_, _, asia, europe, us) = temporal_encodings(1_699_970_400_000);
        assert_eq!(asia, 0.0);
        assert_eq!(europe, 1.0);
        assert_eq!(us, 1.0);
    }
}
