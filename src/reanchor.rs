// =============================================================================
// Re-Anchor Coordinator — rebuild hot state from an authoritative snapshot
// =============================================================================
//
// One attempt walks six phases: lease, snapshot fetch (deadline-bounded),
// shadow construction with the aggregator's own rules, invariant + sanity
// validation, atomic substitute, lease release. Any phase failure releases
// the lease and schedules a bounded backoff retry. Readers keep the previous
// revision for the whole rebuild; the swap is the only observable step.
//
// After `reanchor_max_attempts` consecutive failures the coordinator latches
// DEGRADED; the next success clears it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::detector::Discontinuity;
use crate::hot_state::{HotState, ReanchorToken, StateBundle};
use crate::market_data::{FeatureVector, MidHistory, OrderBook, TradeStats, TradeWindow, WindowTrade};
use crate::snapshot::{DepthSnapshot, SnapshotSource, SnapshotTrade};
use crate::stats::PipelineStats;

// ---------------------------------------------------------------------------
// Shared recovery state
// ---------------------------------------------------------------------------

/// Recovery flags shared by the detector (cooldown gate), the coordinator
/// (failure accounting) and the inference tick (DEGRADED discount).
#[derive(Debug, Default)]
pub struct RecoveryShared {
    pub attempt_in_flight: AtomicBool,
    pub degraded: AtomicBool,
    consecutive_failures: AtomicU32,
    success_count: AtomicU64,
    last_success_at: Mutex<Option<Instant>>,
}

impl RecoveryShared {
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn in_cooldown(&self, cooldown: std::time::Duration) -> bool {
        matches!(*self.last_success_at.lock(), Some(at) if at.elapsed() < cooldown)
    }

    pub(crate) fn note_success(&self) {
        *self.last_success_at.lock() = Some(Instant::now());
        self.consecutive_failures.store(0, Ordering::Release);
        let was_degraded = self.degraded.swap(false, Ordering::AcqRel);
        self.success_count.fetch_add(1, Ordering::AcqRel);
        if was_degraded {
            info!("re-anchor recovered — leaving DEGRADED");
        }
    }

    fn note_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }
}

// ---------------------------------------------------------------------------
// Commit notification
// ---------------------------------------------------------------------------

/// Sent to the aggregator after a committed substitute so it can adopt the
/// new book, rebuild its private windows and reset its baselines.
#[derive(Debug)]
pub struct ReanchorCommit {
    pub revision: u64,
    pub order_book: OrderBook,
    pub window_trades: Vec<WindowTrade>,
    pub snapshot_ts_us: i64,
}

// ---------------------------------------------------------------------------
// Shadow construction
// ---------------------------------------------------------------------------

/// Candidate bundle built offline from a snapshot, prior to validation.
pub(crate) struct ShadowBundle {
    pub book: OrderBook,
    pub trades_1s: TradeStats,
    pub trades_5s: TradeStats,
    pub features: FeatureVector,
    pub window_trades: Vec<WindowTrade>,
}

/// Build a candidate bundle from fetched data using the same construction
/// rules the aggregator applies, in batch.
pub(crate) fn build_shadow(
    config: &PipelineConfig,
    snapshot: &DepthSnapshot,
    trades: &[SnapshotTrade],
) -> ShadowBundle {
    let snap_ts_us = snapshot.server_ts_us;

    let mut book = OrderBook::from_snapshot(
        &config.symbol,
        &snapshot.bids,
        &snapshot.asks,
        snapshot.update_id,
        snap_ts_us,
        config.orderbook_levels,
    );

    let window_trades: Vec<WindowTrade> = trades
        .iter()
        .map(|t| WindowTrade {
            ts_us: t.event_ts_us,
            price: t.price,
            size: t.size,
            is_taker_buy: !t.buyer_is_maker,
        })
        .collect();

    if let Some(last) = trades
        .iter()
        .filter(|t| t.event_ts_us <= snap_ts_us)
        .max_by_key(|t| t.event_ts_us)
    {
        book.set_last_trade_price(last.price, last.event_ts_us);
    }

    let (short_ms, long_ms) = window_pair(config);
    let mut w_short = TradeWindow::new(short_ms);
    let mut w_long = TradeWindow::new(long_ms);
    w_short.reset_from(&window_trades, snap_ts_us);
    w_long.reset_from(&window_trades, snap_ts_us);

    let mid = book.mid();
    let trades_1s = w_short.stats(snap_ts_us, mid);
    let trades_5s = w_long.stats(snap_ts_us, mid);

    let mut history = MidHistory::new();
    if let Some(m) = mid {
        history.push(snap_ts_us, m);
    }

    let now_ms = snap_ts_us / 1_000;
    let features = FeatureVector::compute(&book, &trades_1s, &trades_5s, &history, now_ms);

    ShadowBundle {
        book,
        trades_1s,
        trades_5s,
        features,
        window_trades,
    }
}

/// The two maintained windows (short, long), from config with canonical
/// fallbacks.
pub(crate) fn window_pair(config: &PipelineConfig) -> (u64, u64) {
    let mut ws = config.rolling_windows_ms.clone();
    ws.sort_unstable();
    let short = ws.first().copied().unwrap_or(1_000);
    let long = ws.last().copied().unwrap_or(5_000);
    (short, long)
}

/// Verify the shadow's invariants plus the sanity bounds against the last
/// known good state.
pub(crate) fn validate_shadow(
    shadow: &ShadowBundle,
    current: Option<&StateBundle>,
    config: &PipelineConfig,
) -> Result<()> {
    shadow.book.validate().context("shadow book invalid")?;

    if !shadow.features.all_finite() {
        bail!("shadow feature vector contains non-finite values");
    }

    let new_mid = shadow
        .book
        .mid()
        .context("shadow book has no mid after validation")?;

    if let Some(cur) = current {
        let reference = cur.order_book.mid().or(cur.order_book.last_trade_price);
        if let Some(old_mid) = reference {
            if old_mid > 0.0 {
                let deviation = (new_mid / old_mid - 1.0).abs();
                if deviation > config.sanity_price_deviation {
                    bail!(
                        "shadow mid {new_mid} deviates {:.2}% from last known mid {old_mid}",
                        deviation * 100.0
                    );
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct ReAnchorCoordinator {
    config: Arc<PipelineConfig>,
    hot_state: Arc<HotState>,
    source: Arc<dyn SnapshotSource>,
    shared: Arc<RecoveryShared>,
    stats: Arc<PipelineStats>,
    commit_tx: mpsc::Sender<ReanchorCommit>,
    shutdown: watch::Receiver<bool>,
}

impl ReAnchorCoordinator {
    pub fn new(
        config: Arc<PipelineConfig>,
        hot_state: Arc<HotState>,
        source: Arc<dyn SnapshotSource>,
        shared: Arc<RecoveryShared>,
        stats: Arc<PipelineStats>,
        commit_tx: mpsc::Sender<ReanchorCommit>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            hot_state,
            source,
            shared,
            stats,
            commit_tx,
            shutdown,
        }
    }

    pub fn in_cooldown(&self) -> bool {
        self.shared.in_cooldown(self.config.recovery_cooldown())
    }

    pub fn success_count(&self) -> u64 {
        self.shared.success_count()
    }

    pub fn is_degraded(&self) -> bool {
        self.shared.is_degraded()
    }

    /// Spawn a re-anchor run unless one is already in flight. Returns whether
    /// a run was started. The loser of a race is a no-op by design.
    pub fn spawn_if_idle(self: &Arc<Self>, reason: Discontinuity) -> bool {
        if self
            .shared
            .attempt_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(rule = %reason.rule, "re-anchor already in flight — ignoring trigger");
            return false;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_attempts(reason).await;
            this.shared.attempt_in_flight.store(false, Ordering::Release);
        });
        true
    }

    /// Drive bounded attempts with exponential backoff until one commits or
    /// the budget is exhausted.
    pub async fn run_attempts(&self, reason: Discontinuity) {
        let max_attempts = self.config.reanchor_max_attempts.max(1);

        info!(
            rule = %reason.rule,
            severity = %reason.severity,
            detail = %reason.detail,
            "re-anchor starting"
        );

        for attempt in 1..=max_attempts {
            if *self.shutdown.borrow() {
                info!("shutdown requested — abandoning re-anchor");
                return;
            }

            PipelineStats::incr(&self.stats.reanchor_attempts);

            let token = match self
                .hot_state
                .try_begin_reanchor(self.config.reanchor_lease_ttl())
            {
                Ok(token) => token,
                Err(crate::error::HotStateError::Busy) => {
                    info!("re-anchor lease busy — another attempt holds it");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "unexpected lease failure");
                    return;
                }
            };

            let outcome = tokio::time::timeout(
                self.config.reanchor_total_deadline(),
                self.attempt(&token),
            )
            .await;

            match outcome {
                Ok(Ok(commit)) => {
                    if let Err(e) = self.hot_state.end_reanchor(token) {
                        warn!(error = %e, "lease release after commit failed");
                    }
                    self.shared.note_success();
                    PipelineStats::incr(&self.stats.reanchor_successes);

                    info!(
                        attempt,
                        revision = commit.revision,
                        trades = commit.window_trades.len(),
                        "re-anchor committed"
                    );

                    if self.commit_tx.send(commit).await.is_err() {
                        warn!("aggregator commit channel closed");
                    }
                    return;
                }
                Ok(Err(e)) => {
                    if let Err(le) = self.hot_state.end_reanchor(token) {
                        debug!(error = %le, "lease release after failure");
                    }
                    self.record_failure(attempt, max_attempts, &format!("{e:#}"));
                }
                Err(_) => {
                    if let Err(le) = self.hot_state.end_reanchor(token) {
                        debug!(error = %le, "lease release after deadline");
                    }
                    self.record_failure(attempt, max_attempts, "attempt deadline exceeded");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.config.reanchor_backoff(attempt)).await;
            }
        }

        error!(
            attempts = max_attempts,
            "re-anchor exhausted all attempts — readers stay on the last good revision"
        );
    }

    /// Phases 2-5 of one attempt: fetch, build, validate, substitute.
    async fn attempt(&self, token: &ReanchorToken) -> Result<ReanchorCommit> {
        let symbol = &self.config.symbol;

        let snapshot = self
            .source
            .depth_snapshot(symbol)
            .await
            .context("depth snapshot fetch failed")?;

        let (_, long_ms) = window_pair(&self.config);
        let from_ts_us = snapshot.server_ts_us - (long_ms as i64) * 1_000;
        let trades = self
            .source
            .recent_trades(symbol, from_ts_us)
            .await
            .context("recent trades fetch failed")?;

        let shadow = build_shadow(&self.config, &snapshot, &trades);

        let current = self.hot_state.get();
        if let Err(e) = validate_shadow(&shadow, current.as_deref(), &self.config) {
            PipelineStats::incr(&self.stats.shadow_rejections);
            return Err(e.context("shadow validation failed"));
        }

        let revision = self
            .hot_state
            .substitute(
                token,
                shadow.book.clone(),
                shadow.trades_1s,
                shadow.trades_5s,
                shadow.features,
            )
            .context("substitute rejected")?;

        Ok(ReanchorCommit {
            revision,
            order_book: shadow.book,
            window_trades: shadow.window_trades,
            snapshot_ts_us: snapshot.server_ts_us,
        })
    }

    fn record_failure(&self, attempt: u32, max_attempts: u32, reason: &str) {
        let consecutive = self.shared.note_failure();
        PipelineStats::incr(&self.stats.reanchor_failures);

        warn!(attempt, max_attempts, consecutive, reason, "re-anchor attempt failed");

        if consecutive >= self.config.reanchor_max_attempts
            && !self.shared.degraded.swap(true, Ordering::AcqRel)
        {
            error!(
                consecutive,
                "re-anchor entering DEGRADED — predictions continue at reduced confidence"
            );
        }
    }
}
