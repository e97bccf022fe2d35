// =============================================================================
// Gap Detector — continuity rules over the event stream
// =============================================================================
//
// Wakes on every aggregator observation and on a coarse periodic tick. Each
// rule carries its own severity; any declared discontinuity hands off to the
// re-anchor coordinator. After a successful re-anchor the recovery cooldown
// suppresses further triggers: detections are still counted, never acted on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::feed::FeedHealth;
use crate::reanchor::ReAnchorCoordinator;
use crate::stats::PipelineStats;
use crate::types::StreamObservation;

// ---------------------------------------------------------------------------
// Detection types
// ---------------------------------------------------------------------------

/// The continuity rule that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GapRule {
    SequenceGap,
    DepthGap,
    Silence,
    PriceJump,
    ConnectionLoss,
}

impl std::fmt::Display for GapRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SequenceGap => write!(f, "sequence_gap"),
            Self::DepthGap => write!(f, "depth_gap"),
            Self::Silence => write!(f, "silence"),
            Self::PriceJump => write!(f, "price_jump"),
            Self::ConnectionLoss => write!(f, "connection_loss"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A declared discontinuity. Triggers one re-anchor attempt, cooldown
/// permitting.
#[derive(Debug, Clone, Serialize)]
pub struct Discontinuity {
    pub rule: GapRule,
    pub severity: Severity,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// GapDetector
// ---------------------------------------------------------------------------

/// Stateful rule engine. Pure with respect to time: callers pass `now` so the
/// rules are testable without a clock.
pub struct GapDetector {
    config: Arc<PipelineConfig>,

    last_seq_id: Option<u64>,
    /// Consecutive observations with a sequence gap (rule parameter k).
    gap_run: u32,
    last_trade_price: Option<f64>,
    last_event_at: Option<Instant>,
}

impl GapDetector {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self {
            config,
            last_seq_id: None,
            gap_run: 0,
            last_trade_price: None,
            last_event_at: None,
        }
    }

    /// Evaluate one observation against the per-event rules. Returns the
    /// highest-priority discontinuity, if any.
    pub fn observe(&mut self, obs: &StreamObservation, now: Instant) -> Option<Discontinuity> {
        self.last_event_at = Some(now);

        let mut detected: Option<Discontinuity> = None;

        // ── Depth gap ───────────────────────────────────────────────────
        if let Some((expected, got)) = obs.depth_gap {
            if self.config.depth_gap_enabled {
                detected = Some(Discontinuity {
                    rule: GapRule::DepthGap,
                    severity: Severity::High,
                    detail: format!("depth update id jumped: expected {expected}, got {got}"),
                });
            }
        }

        // ── Sequence gap ────────────────────────────────────────────────
        if let Some(last) = self.last_seq_id {
            if obs.seq_id > last + 1 {
                self.gap_run += 1;
                if detected.is_none() && self.gap_run >= self.config.sequence_gap_k {
                    detected = Some(Discontinuity {
                        rule: GapRule::SequenceGap,
                        severity: Severity::High,
                        detail: format!(
                            "seq jumped from {last} to {} ({} consecutive)",
                            obs.seq_id, self.gap_run
                        ),
                    });
                }
            } else {
                self.gap_run = 0;
            }
        }
        self.last_seq_id = Some(self.last_seq_id.map_or(obs.seq_id, |l| l.max(obs.seq_id)));

        // ── Price jump ──────────────────────────────────────────────────
        if let Some(price) = obs.trade_price {
            if let Some(last) = self.last_trade_price {
                if last > 0.0 {
                    let change = (price / last - 1.0).abs();
                    if detected.is_none() && change > self.config.price_jump_pct {
                        detected = Some(Discontinuity {
                            rule: GapRule::PriceJump,
                            severity: Severity::High,
                            detail: format!(
                                "trade price jumped {:.3}% ({last} -> {price})",
                                change * 100.0
                            ),
                        });
                    }
                }
            }
            self.last_trade_price = Some(price);
        }

        detected
    }

    /// Evaluate the timer-driven rules (silence, connection loss).
    pub fn check_timers(
        &mut self,
        now: Instant,
        disconnected_for: Option<Duration>,
    ) -> Option<Discontinuity> {
        if let Some(down) = disconnected_for {
            if down > self.config.connection_loss() {
                return Some(Discontinuity {
                    rule: GapRule::ConnectionLoss,
                    severity: Severity::Critical,
                    detail: format!("transport down for {:.1}s", down.as_secs_f64()),
                });
            }
        }

        if let Some(last) = self.last_event_at {
            let silent = now.saturating_duration_since(last);
            if silent > self.config.silence_timeout() {
                return Some(Discontinuity {
                    rule: GapRule::Silence,
                    severity: Severity::Medium,
                    detail: format!("no events for {:.1}s", silent.as_secs_f64()),
                });
            }
        }

        None
    }

    /// Drop all continuity baselines. Called after a committed re-anchor so
    /// the first post-commit event is never judged against pre-gap state.
    pub fn reset_baseline(&mut self, now: Instant) {
        self.last_seq_id = None;
        self.gap_run = 0;
        self.last_trade_price = None;
        self.last_event_at = Some(now);
        debug!("gap detector baseline reset");
    }
}

// ---------------------------------------------------------------------------
// Task loop
// ---------------------------------------------------------------------------

/// Period of the timer-driven rule check.
const TIMER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Run the gap-detector task. Consumes aggregator observations, evaluates the
/// timer rules once a second, and hands detected discontinuities to the
/// coordinator (which enforces single-flight via the hot-state lease).
pub async fn run_gap_detector(
    mut detector: GapDetector,
    mut obs_rx: mpsc::Receiver<StreamObservation>,
    coordinator: Arc<ReAnchorCoordinator>,
    feed_health: Arc<FeedHealth>,
    stats: Arc<PipelineStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("gap detector started");

    let mut ticker = tokio::time::interval(TIMER_CHECK_INTERVAL);
    let mut seen_successes = coordinator.success_count();

    loop {
        // A committed re-anchor invalidates every baseline the rules hold.
        let successes = coordinator.success_count();
        if successes != seen_successes {
            seen_successes = successes;
            detector.reset_baseline(Instant::now());
        }

        let detected = tokio::select! {
            maybe_obs = obs_rx.recv() => match maybe_obs {
                Some(obs) => detector.observe(&obs, Instant::now()),
                None => {
                    info!("observation channel closed; gap detector exiting");
                    return;
                }
            },
            _ = ticker.tick() => {
                detector.check_timers(Instant::now(), feed_health.disconnected_for())
            }
            _ = shutdown.changed() => {
                info!("gap detector shutting down");
                return;
            }
        };

        if let Some(disc) = detected {
            PipelineStats::incr(&stats.gaps_detected);

            if coordinator.in_cooldown() {
                PipelineStats::incr(&stats.gaps_suppressed);
                debug!(
                    rule = %disc.rule,
                    detail = %disc.detail,
                    "discontinuity detected during recovery cooldown — suppressed"
                );
                continue;
            }

            warn!(
                rule = %disc.rule,
                severity = %disc.severity,
                detail = %disc.detail,
                "discontinuity declared — requesting re-anchor"
            );
            coordinator.spawn_if_idle(disc);
        }
    }
}
