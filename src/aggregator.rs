// =============================================================================
// Aggregator — single-writer consumer of the ordered event stream
// =============================================================================
//
// Owns the canonical market state during steady operation: the order book,
// the rolling trade windows and the private mid-price history. Every
// processed event publishes derived state into HotState via copy-on-write,
// forwards a digest to the gap detector, and never blocks on anything but
// the event input itself. Malformed events are counted and dropped before
// any mutation.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::hot_state::HotState;
use crate::market_data::{
    DepthApplyOutcome, FeatureVector, MidHistory, OrderBook, TradeWindow, WindowTrade,
};
use crate::reanchor::{window_pair, ReanchorCommit};
use crate::stats::PipelineStats;
use crate::types::{MarketEvent, StreamObservation};

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub struct Aggregator {
    config: Arc<PipelineConfig>,
    hot_state: Arc<HotState>,
    stats: Arc<PipelineStats>,
    obs_tx: mpsc::Sender<StreamObservation>,

    book: OrderBook,
    win_short: TradeWindow,
    win_long: TradeWindow,
    history: MidHistory,

    /// Event time high-water mark: max(event_ts) seen so far.
    now_us: i64,
    last_feature_at: Option<Instant>,
    /// Best (bid, ask) at the last feature recompute, for the quote-move
    /// trigger.
    quote_at_last_features: Option<(f64, f64)>,
}

impl Aggregator {
    pub fn new(
        config: Arc<PipelineConfig>,
        hot_state: Arc<HotState>,
        stats: Arc<PipelineStats>,
        obs_tx: mpsc::Sender<StreamObservation>,
    ) -> Self {
        let (short_ms, long_ms) = window_pair(&config);
        let book = OrderBook::new(config.symbol.clone(), config.orderbook_levels);

        Self {
            config,
            hot_state,
            stats,
            obs_tx,
            book,
            win_short: TradeWindow::new(short_ms),
            win_long: TradeWindow::new(long_ms),
            history: MidHistory::new(),
            now_us: 0,
            last_feature_at: None,
            quote_at_last_features: None,
        }
    }

    /// Process one event: validate, apply, publish, observe.
    pub fn handle_event(&mut self, event: MarketEvent) {
        if let Err(e) = event.validate() {
            PipelineStats::incr(&self.stats.malformed_events);
            debug!(error = %e, kind = %event.kind(), "malformed event dropped");
            return;
        }

        self.now_us = self.now_us.max(event.event_ts_us());

        let mut trade_price = None;
        let mut depth_gap = None;
        let mut book_changed = true;

        match &event {
            MarketEvent::Trade(t) => {
                let wt = WindowTrade {
                    ts_us: t.event_ts_us,
                    price: t.price,
                    size: t.size,
                    is_taker_buy: t.is_taker_buy(),
                };
                self.win_short.push(wt);
                self.win_long.push(wt);
                self.book.set_last_trade_price(t.price, t.event_ts_us);
                trade_price = Some(t.price);
            }
            MarketEvent::BestBidAsk(e) => {
                self.book.apply_best_bid_ask(e);
                if let Some(mid) = self.book.mid() {
                    self.history.push(self.now_us, mid);
                }
            }
            MarketEvent::DepthDiff(e) => match self.book.apply_depth_diff(e) {
                DepthApplyOutcome::Applied => {
                    if let Some(mid) = self.book.mid() {
                        self.history.push(self.now_us, mid);
                    }
                }
                DepthApplyOutcome::StaleIgnored => {
                    PipelineStats::incr(&self.stats.depth_diffs_ignored);
                    book_changed = false;
                }
                DepthApplyOutcome::Gap { expected, got } => {
                    depth_gap = Some((expected, got));
                    if let Some(mid) = self.book.mid() {
                        self.history.push(self.now_us, mid);
                    }
                }
            },
        }

        // Time-based eviction runs on every event so quiet windows drain.
        self.win_short.advance(self.now_us);
        self.win_long.advance(self.now_us);

        PipelineStats::incr(&self.stats.events_processed);

        if book_changed {
            self.publish();
        }

        let obs = StreamObservation {
            seq_id: event.seq_id(),
            event_ts_us: event.event_ts_us(),
            kind: event.kind(),
            trade_price,
            depth_gap,
        };
        if self.obs_tx.try_send(obs).is_err() {
            PipelineStats::incr(&self.stats.observations_dropped);
        }
    }

    /// Publish the current derived state into HotState, recomputing the
    /// feature vector when the recompute policy says so.
    fn publish(&mut self) {
        let mid = self.book.mid();
        let trades_1s = self.win_short.stats(self.now_us, mid);
        let trades_5s = self.win_long.stats(self.now_us, mid);

        let recompute = self.should_recompute_features();
        let features = if recompute {
            let now_ms = Utc::now().timestamp_millis();
            Some(FeatureVector::compute(
                &self.book, &trades_1s, &trades_5s, &self.history, now_ms,
            ))
        } else {
            None
        };

        let book = self.book.clone();
        self.hot_state.apply(move |bundle| {
            bundle.order_book = book;
            bundle.trades_1s = trades_1s;
            bundle.trades_5s = trades_5s;
            if let Some(fv) = features {
                bundle.features = fv;
            }
        });

        if recompute {
            self.last_feature_at = Some(Instant::now());
            self.quote_at_last_features = match (self.book.best_bid(), self.book.best_ask()) {
                (Some(b), Some(a)) => Some((b.price, a.price)),
                _ => None,
            };
            PipelineStats::incr(&self.stats.feature_recomputes);
        }
    }

    /// Recompute when (a) the feature interval elapsed, or (b) the best quote
    /// moved beyond the configured threshold. Re-anchor adoption clears the
    /// timer, which covers trigger (c).
    fn should_recompute_features(&self) -> bool {
        let interval_elapsed = match self.last_feature_at {
            None => true,
            Some(at) => at.elapsed() >= self.config.feature_interval(),
        };
        if interval_elapsed {
            return true;
        }

        if let (Some((bid0, ask0)), Some(b), Some(a)) = (
            self.quote_at_last_features,
            self.book.best_bid(),
            self.book.best_ask(),
        ) {
            let threshold = self.config.quote_move_threshold_pct;
            let bid_moved = bid0 > 0.0 && (b.price / bid0 - 1.0).abs() > threshold;
            let ask_moved = ask0 > 0.0 && (a.price / ask0 - 1.0).abs() > threshold;
            if bid_moved || ask_moved {
                return true;
            }
        }

        false
    }

    /// Adopt a committed re-anchor: replace the private book, rebuild the
    /// windows from the snapshot's trades and drop stale history. The next
    /// event will recompute features against the adopted state.
    pub fn adopt(&mut self, commit: ReanchorCommit) {
        self.now_us = self.now_us.max(commit.snapshot_ts_us);
        self.book = commit.order_book;

        self.win_short.reset_from(&commit.window_trades, self.now_us);
        self.win_long.reset_from(&commit.window_trades, self.now_us);

        self.history.clear();
        if let Some(mid) = self.book.mid() {
            self.history.push(self.now_us, mid);
        }

        self.last_feature_at = None;
        self.quote_at_last_features = None;

        info!(
            revision = commit.revision,
            last_update_id = self.book.last_update_id,
            window_trades = commit.window_trades.len(),
            "aggregator adopted re-anchored state"
        );
    }

    #[cfg(test)]
    fn book(&self) -> &OrderBook {
        &self.book
    }
}

// ---------------------------------------------------------------------------
// Task loop
// ---------------------------------------------------------------------------

/// Run the aggregator task. Consumes the event stream in arrival order and
/// adopts re-anchor commits between events. On shutdown the pending input is
/// drained so the current event always finishes.
pub async fn run_aggregator(
    mut aggregator: Aggregator,
    mut event_rx: mpsc::Receiver<MarketEvent>,
    mut commit_rx: mpsc::Receiver<ReanchorCommit>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("aggregator started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                while let Ok(event) = event_rx.try_recv() {
                    aggregator.handle_event(event);
                }
                info!("aggregator drained input and shut down");
                return;
            }

            Some(commit) = commit_rx.recv() => {
                aggregator.adopt(commit);
            }

            maybe_event = event_rx.recv() => match maybe_event {
                Some(event) => aggregator.handle_event(event),
                None => {
                    warn!("event input ended; aggregator exiting");
                    return;
                }
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BestBidAskEvent, DepthDiffEvent, LevelDelta, TradeEvent};

    fn test_setup(feature_interval_ms: u64) -> (Aggregator, Arc<HotState>, mpsc::Receiver<StreamObservation>) {
        let mut cfg = PipelineConfig::default();
        cfg.feature_interval_ms = feature_interval_ms;
        let config = Arc::new(cfg);
        let hot_state = Arc::new(HotState::new(config.symbol.clone(), config.orderbook_levels));
        let stats = Arc::new(PipelineStats::default());
        let (obs_tx, obs_rx) = mpsc::channel(64);
        let agg = Aggregator::new(config, Arc::clone(&hot_state), stats, obs_tx);
        (agg, hot_state, obs_rx)
    }

    fn bba(ts_us: i64, seq: u64, bid: f64, bid_sz: f64, ask: f64, ask_sz: f64) -> MarketEvent {
        MarketEvent::BestBidAsk(BestBidAskEvent {
            event_ts_us: ts_us,
            bid_px: bid,
            bid_sz,
            ask_px: ask,
            ask_sz,
            seq_id: seq,
        })
    }

    fn trade(ts_us: i64, seq: u64, id: u64, px: f64, sz: f64, buyer_maker: bool) -> MarketEvent {
        MarketEvent::Trade(TradeEvent {
            event_ts_us: ts_us,
            trade_id: id,
            price: px,
            size: sz,
            buyer_is_maker: buyer_maker,
            seq_id: seq,
        })
    }

    #[test]
    fn steady_state_scenario_builds_expected_features() {
        // Recompute on every event so the final trade refreshes the vector.
        let (mut agg, hot_state, _obs_rx) = test_setup(0);

        agg.handle_event(bba(1_000_000, 1, 100.00, 1.0, 100.02, 1.0));
        agg.handle_event(trade(1_100_000, 2, 1, 100.01, 0.5, false));
        agg.handle_event(trade(1_200_000, 3, 2, 100.02, 0.3, true));

        let bundle = hot_state.get().expect("initialised");
        assert_eq!(bundle.revision, 1);

        let fv = &bundle.features;
        assert_eq!(fv.price, Some(100.02));
        assert!((fv.mid.unwrap() - 100.01).abs() < 1e-9);
        assert!((fv.volume_1s.unwrap() - 0.8).abs() < 1e-12);
        assert!((fv.signed_volume_1s.unwrap() - 0.2).abs() < 1e-12);
        assert!((fv.spread_bp.unwrap() - 2.0).abs() < 1e-9);
        assert!((fv.completeness - 1.0).abs() < 1e-12);

        let ts = &bundle.trades_1s;
        assert_eq!(ts.count, 2);
        assert!((ts.vwap.unwrap() - 100.01375).abs() < 1e-9);
        assert_eq!(bundle.order_book.last_trade_price, Some(100.02));
    }

    #[test]
    fn malformed_event_never_mutates_state() {
        let (mut agg, hot_state, _obs_rx) = test_setup(0);
        agg.handle_event(bba(1_000_000, 1, 100.0, 1.0, 100.02, 1.0));
        let before = hot_state.get().unwrap();

        agg.handle_event(trade(1_100_000, 2, 1, f64::NAN, 0.5, false));

        let after = hot_state.get().unwrap();
        assert_eq!(before.trades_1s.count, after.trades_1s.count);
        assert_eq!(agg.stats.snapshot().malformed_events, 1);
    }

    #[test]
    fn stale_depth_diff_leaves_published_book_unchanged() {
        let (mut agg, hot_state, _obs_rx) = test_setup(0);

        agg.handle_event(MarketEvent::DepthDiff(DepthDiffEvent {
            event_ts_us: 1_000_000,
            first_update_id: 1,
            final_update_id: 10,
            bids: vec![LevelDelta { price: 100.0, size: 1.0 }],
            asks: vec![LevelDelta { price: 100.5, size: 1.0 }],
            seq_id: 1,
        }));
        let before = hot_state.get().unwrap();
        assert_eq!(before.order_book.last_update_id, 10);

        // Replay of the same range.
        agg.handle_event(MarketEvent::DepthDiff(DepthDiffEvent {
            event_ts_us: 1_100_000,
            first_update_id: 1,
            final_update_id: 10,
            bids: vec![LevelDelta { price: 99.0, size: 9.0 }],
            asks: vec![],
            seq_id: 2,
        }));

        let after = hot_state.get().unwrap();
        assert_eq!(after.order_book.last_update_id, 10);
        assert_eq!(after.order_book.bids, before.order_book.bids);
        assert_eq!(agg.stats.snapshot().depth_diffs_ignored, 1);
    }

    #[test]
    fn depth_gap_hint_is_forwarded_to_observations() {
        let (mut agg, _hot_state, mut obs_rx) = test_setup(0);

        agg.handle_event(MarketEvent::DepthDiff(DepthDiffEvent {
            event_ts_us: 1_000_000,
            first_update_id: 1,
            final_update_id: 10,
            bids: vec![LevelDelta { price: 100.0, size: 1.0 }],
            asks: vec![LevelDelta { price: 100.5, size: 1.0 }],
            seq_id: 1,
        }));
        // Jump: expected 11, got 20.
        agg.handle_event(MarketEvent::DepthDiff(DepthDiffEvent {
            event_ts_us: 1_100_000,
            first_update_id: 20,
            final_update_id: 21,
            bids: vec![],
            asks: vec![LevelDelta { price: 100.6, size: 2.0 }],
            seq_id: 2,
        }));

        let first = obs_rx.try_recv().unwrap();
        assert_eq!(first.depth_gap, None);
        let second = obs_rx.try_recv().unwrap();
        assert_eq!(second.depth_gap, Some((11, 20)));
        assert_eq!(second.seq_id, 2);
    }

    #[test]
    fn trades_evict_as_event_time_advances() {
        let (mut agg, hot_state, _obs_rx) = test_setup(0);

        agg.handle_event(bba(1_000_000, 1, 100.0, 1.0, 100.02, 1.0));
        agg.handle_event(trade(1_100_000, 2, 1, 100.01, 0.5, false));
        // A quote 2s later pushes the 1s window past the trade.
        agg.handle_event(bba(3_100_000, 3, 100.0, 1.0, 100.02, 1.0));

        let bundle = hot_state.get().unwrap();
        assert!(bundle.trades_1s.is_empty());
        assert!(!bundle.trades_5s.is_empty());
    }

    #[test]
    fn adopt_resets_state_from_commit() {
        let (mut agg, hot_state, _obs_rx) = test_setup(0);
        agg.handle_event(bba(1_000_000, 1, 100.0, 1.0, 100.02, 1.0));

        let book = OrderBook::from_snapshot(
            "BTCUSDT",
            &[(102.0, 1.0), (101.5, 2.0)],
            &[(102.2, 1.0), (102.5, 2.0)],
            1_000,
            9_000_000,
            10,
        );
        let commit = ReanchorCommit {
            revision: 2,
            order_book: book,
            window_trades: vec![
                WindowTrade { ts_us: 8_200_000, price: 102.1, size: 0.4, is_taker_buy: true },
                WindowTrade { ts_us: 8_900_000, price: 102.0, size: 0.6, is_taker_buy: false },
            ],
            snapshot_ts_us: 9_000_000,
        };

        agg.adopt(commit);
        assert_eq!(agg.book().last_update_id, 1_000);

        // Next event publishes the adopted state with a fresh feature vector.
        agg.handle_event(bba(9_100_000, 50, 102.0, 1.0, 102.2, 1.0));
        let bundle = hot_state.get().unwrap();
        assert_eq!(bundle.order_book.last_update_id, 1_000);
        assert_eq!(bundle.trades_5s.count, 2);
        assert!((bundle.features.mid.unwrap() - 102.1).abs() < 1e-9);
    }

    #[test]
    fn quote_move_triggers_recompute_before_interval() {
        // Long interval: only the quote-move path can fire after the first
        // compute.
        let (mut agg, hot_state, _obs_rx) = test_setup(60_000);

        agg.handle_event(bba(1_000_000, 1, 100.0, 1.0, 100.02, 1.0));
        let first_ts = hot_state.get().unwrap().features.ts_ms;

        // 0.01% move: below the 0.05% default threshold, no recompute.
        agg.handle_event(bba(1_100_000, 2, 100.01, 1.0, 100.03, 1.0));
        assert_eq!(hot_state.get().unwrap().features.ts_ms, first_ts);

        // 0.2% move: recompute fires.
        agg.handle_event(bba(1_200_000, 3, 100.2, 1.0, 100.22, 1.0));
        let fv = &hot_state.get().unwrap().features;
        assert!((fv.mid.unwrap() - 100.21).abs() < 1e-9);
    }
}
