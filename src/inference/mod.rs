// =============================================================================
// Inference Tick — periodic model evaluation over a consistent revision
// =============================================================================
//
// Every `tick_period` the engine reads one hot-state revision, gates it on
// freshness and completeness, evaluates the pretrained regressor and
// publishes a prediction. The schedule is drift-free: the next deadline is
// always `previous + period`, and a late loop catches up at most one period
// before skipping the rest of the backlog.
//
// The prediction path never propagates an error upward; degraded modes
// replace exceptions.

pub mod model;
pub mod sink;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::hot_state::HotState;
use crate::market_data::FeatureVector;
use crate::reanchor::RecoveryShared;
use crate::stats::PipelineStats;

use model::PricePredictor;
use sink::PredictionSink;

// ---------------------------------------------------------------------------
// Confidence ladder constants
// ---------------------------------------------------------------------------

const BASE_CONFIDENCE: f64 = 0.8;
const MIN_CONFIDENCE: f64 = 0.1;
/// Feature age beyond which the stale discount applies (distinct from the
/// hard staleness gate).
const STALE_FEATURE_AGE_MS: i64 = 2_000;
const STALE_DISCOUNT: f64 = 0.7;
/// Relative price volatility above which the high-volatility discount applies.
const HIGH_VOL_THRESHOLD: f64 = 0.01;
const VOL_DISCOUNT: f64 = 0.7;
const WIDE_SPREAD_BP: f64 = 10.0;
const SPREAD_DISCOUNT: f64 = 0.8;
/// Applied while the re-anchor path is DEGRADED.
const RECOVERY_DISCOUNT: f64 = 0.5;
/// Fixed confidence of the stale-extrapolation mode.
const STALE_MODE_CONFIDENCE: f64 = 0.3;
/// Fixed confidence of the flat fallback on model errors.
const ERROR_MODE_CONFIDENCE: f64 = 0.1;

// ---------------------------------------------------------------------------
// Prediction record
// ---------------------------------------------------------------------------

/// Provenance of a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionSource {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "degraded-stale")]
    DegradedStale,
    #[serde(rename = "degraded-error")]
    DegradedError,
}

impl std::fmt::Display for PredictionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::DegradedStale => write!(f, "degraded-stale"),
            Self::DegradedError => write!(f, "degraded-error"),
        }
    }
}

/// One published prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub prediction_id: String,
    pub symbol: String,
    pub tick_ts_ms: i64,
    pub current_price: f64,
    pub predicted_price: f64,
    /// How far ahead the prediction targets, milliseconds.
    pub target_offset_ms: u64,
    /// In [0.1, 1.0].
    pub confidence: f64,
    pub model_version: String,
    pub feature_age_ms: i64,
    pub inference_latency_us: i64,
    pub source: PredictionSource,
}

// ---------------------------------------------------------------------------
// InferenceEngine
// ---------------------------------------------------------------------------

pub struct InferenceEngine {
    config: Arc<PipelineConfig>,
    hot_state: Arc<HotState>,
    predictor: Arc<PricePredictor>,
    sink: Arc<dyn PredictionSink>,
    recovery: Arc<RecoveryShared>,
    stats: Arc<PipelineStats>,
    last_prediction: Option<PredictionRecord>,
}

impl InferenceEngine {
    pub fn new(
        config: Arc<PipelineConfig>,
        hot_state: Arc<HotState>,
        predictor: Arc<PricePredictor>,
        sink: Arc<dyn PredictionSink>,
        recovery: Arc<RecoveryShared>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            config,
            hot_state,
            predictor,
            sink,
            recovery,
            stats,
            last_prediction: None,
        }
    }

    /// Produce one prediction from the current revision, or `None` when the
    /// store is uninitialised or carries no price at all.
    pub fn tick(&mut self, now_ms: i64) -> Option<PredictionRecord> {
        let bundle = match self.hot_state.get() {
            Some(b) => b,
            None => {
                debug!("hot state uninitialised; skipping tick");
                return None;
            }
        };

        let fv = &bundle.features;
        let current_price = match fv.price.or(fv.mid) {
            Some(p) if p > 0.0 => p,
            _ => {
                debug!("no usable price in revision {}; skipping tick", bundle.revision);
                return None;
            }
        };

        // Staleness accrues from both the underlying inputs and the time
        // since the vector was computed.
        let effective_age = fv.data_age_ms + (now_ms - fv.ts_ms).max(0);

        let stale = effective_age > self.config.stale_threshold_ms as i64;
        let incomplete = fv.completeness < self.config.min_completeness;

        let record = if stale || incomplete {
            let reason = if stale { "stale features" } else { "incomplete features" };
            warn!(
                reason,
                age_ms = effective_age,
                completeness = format!("{:.3}", fv.completeness),
                "degraded prediction"
            );
            PipelineStats::incr(&self.stats.predictions_degraded);
            self.extrapolate_stale(now_ms, current_price, effective_age)
        } else {
            match self.predictor.predict(fv) {
                Ok(predicted) => self.record(
                    now_ms,
                    current_price,
                    predicted,
                    self.confidence(fv, effective_age),
                    effective_age,
                    PredictionSource::Normal,
                ),
                Err(e) => {
                    warn!(error = %e, "model evaluation failed; flat fallback");
                    PipelineStats::incr(&self.stats.predictions_degraded);
                    self.record(
                        now_ms,
                        current_price,
                        current_price,
                        ERROR_MODE_CONFIDENCE,
                        effective_age,
                        PredictionSource::DegradedError,
                    )
                }
            }
        };

        Some(record)
    }

    /// Stale mode: continue the previous prediction's implied slope across
    /// the elapsed interval. Without a prior prediction the fallback is flat.
    fn extrapolate_stale(
        &self,
        now_ms: i64,
        current_price: f64,
        effective_age: i64,
    ) -> PredictionRecord {
        let predicted = match &self.last_prediction {
            Some(prev) => {
                let elapsed_ms = (now_ms - prev.tick_ts_ms).max(0) as f64;
                let slope_per_ms =
                    (prev.predicted_price - prev.current_price) / prev.target_offset_ms as f64;
                prev.predicted_price + slope_per_ms * elapsed_ms
            }
            None => current_price,
        };

        self.record(
            now_ms,
            current_price,
            predicted,
            STALE_MODE_CONFIDENCE,
            effective_age,
            PredictionSource::DegradedStale,
        )
    }

    /// The confidence ladder: base x completeness, with stale / volatility /
    /// spread / recovery discounts, clamped to [0.1, 1.0].
    fn confidence(&self, fv: &FeatureVector, effective_age: i64) -> f64 {
        let mut c = BASE_CONFIDENCE * fv.completeness;

        if effective_age > STALE_FEATURE_AGE_MS {
            c *= STALE_DISCOUNT;
        }

        let relative_vol = match (fv.volatility, fv.mid) {
            (Some(v), Some(m)) if m > 0.0 => v / m,
            _ => 0.0,
        };
        if relative_vol > HIGH_VOL_THRESHOLD {
            c *= VOL_DISCOUNT;
        }

        if fv.spread_bp.unwrap_or(0.0) > WIDE_SPREAD_BP {
            c *= SPREAD_DISCOUNT;
        }

        if self.recovery.is_degraded() {
            c *= RECOVERY_DISCOUNT;
        }

        c.clamp(MIN_CONFIDENCE, 1.0)
    }

    fn record(
        &self,
        now_ms: i64,
        current_price: f64,
        predicted_price: f64,
        confidence: f64,
        feature_age_ms: i64,
        source: PredictionSource,
    ) -> PredictionRecord {
        PredictionRecord {
            prediction_id: Uuid::new_v4().to_string(),
            symbol: self.config.symbol.clone(),
            tick_ts_ms: now_ms,
            current_price,
            predicted_price,
            target_offset_ms: self.predictor.horizon_ms(),
            confidence,
            model_version: self.predictor.version().to_string(),
            feature_age_ms,
            inference_latency_us: 0,
            source,
        }
    }

    /// Run the tick loop until shutdown. Deadlines advance by exactly one
    /// period; a loop that falls more than one period behind skips the
    /// backlog rather than bursting.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.tick_period();
        info!(period_ms = self.config.tick_period_ms, "inference tick started");

        let mut next = tokio::time::Instant::now() + period;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = shutdown.changed() => {
                    info!("inference tick shutting down");
                    return;
                }
            }

            let started = std::time::Instant::now();
            let now_ms = Utc::now().timestamp_millis();

            if let Some(mut record) = self.tick(now_ms) {
                record.inference_latency_us = started.elapsed().as_micros() as i64;

                if let Err(e) = self.sink.publish(&record).await {
                    PipelineStats::incr(&self.stats.sink_failures);
                    warn!(error = %e, "prediction publish failed (dropped)");
                }

                PipelineStats::incr(&self.stats.predictions_emitted);
                self.last_prediction = Some(record);
            }

            next += period;

            // Catch up at most one period's worth, then skip the backlog.
            let now = tokio::time::Instant::now();
            if now >= next + period {
                let mut skipped = 0u64;
                while now >= next + period {
                    next += period;
                    skipped += 1;
                }
                self.stats.ticks_skipped.fetch_add(skipped, std::sync::atomic::Ordering::Relaxed);
                warn!(skipped, "inference fell behind schedule; backlog skipped");
            }
        }
    }
}
