// =============================================================================
// Borealis Prediction Engine — Main Entry Point
// =============================================================================
//
// One process per symbol. Four cooperating tasks share a single HotState:
// the feed-driven aggregator (sole steady-state writer), the gap detector,
// on-demand re-anchor attempts, and the periodic inference tick. A watch
// channel coordinates shutdown: the aggregator drains its input, an in-flight
// re-anchor abandons at its next checkpoint, and the inference loop skips its
// next tick.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod config;
mod detector;
mod error;
mod feed;
mod hot_state;
mod inference;
mod market_data;
mod reanchor;
mod snapshot;
mod stats;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::{run_aggregator, Aggregator};
use crate::config::PipelineConfig;
use crate::detector::{run_gap_detector, GapDetector};
use crate::feed::{FeedHealth, MarketFeed};
use crate::hot_state::HotState;
use crate::inference::model::PricePredictor;
use crate::inference::sink::{LogSink, PredictionSink};
use crate::inference::InferenceEngine;
use crate::reanchor::{ReAnchorCoordinator, RecoveryShared};
use crate::snapshot::RestSnapshotClient;
use crate::stats::PipelineStats;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Borealis Prediction Engine — Starting Up          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = PipelineConfig::load("pipeline_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        PipelineConfig::default()
    });

    // Override symbol from env if available.
    if let Ok(sym) = std::env::var("BOREALIS_SYMBOL") {
        let sym = sym.trim().to_uppercase();
        if !sym.is_empty() {
            config.symbol = sym;
        }
    }

    info!(
        symbol = %config.symbol,
        tick_period_ms = config.tick_period_ms,
        feed_url = %config.feed_url,
        "Pipeline configured"
    );

    let config = Arc::new(config);

    // ── 2. Model (load failure is fatal) ─────────────────────────────────
    let predictor = Arc::new(
        PricePredictor::load(&config.model_path)
            .context("model load failed — refusing to start")?,
    );

    // ── 3. Shared state & channels ───────────────────────────────────────
    let hot_state = Arc::new(HotState::new(config.symbol.clone(), config.orderbook_levels));
    let stats = Arc::new(PipelineStats::default());
    let recovery = Arc::new(RecoveryShared::default());
    let feed_health = Arc::new(FeedHealth::new());

    let (event_tx, event_rx) = mpsc::channel(8_192);
    let (obs_tx, obs_rx) = mpsc::channel(8_192);
    let (commit_tx, commit_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 4. Re-anchor coordinator ─────────────────────────────────────────
    let snapshot_source = Arc::new(RestSnapshotClient::new(config.snapshot_base_url.clone()));
    let coordinator = Arc::new(ReAnchorCoordinator::new(
        Arc::clone(&config),
        Arc::clone(&hot_state),
        snapshot_source,
        Arc::clone(&recovery),
        Arc::clone(&stats),
        commit_tx,
        shutdown_rx.clone(),
    ));

    // ── 5. Market feed (with reconnection) ───────────────────────────────
    {
        let feed = MarketFeed::new(Arc::clone(&config), Arc::clone(&feed_health));
        let health = Arc::clone(&feed_health);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match feed.run_once(&event_tx, &mut shutdown).await {
                    Ok(()) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        warn!("Market feed ended — reconnecting in 5s");
                    }
                    Err(e) => {
                        error!(error = %e, "Market feed error — reconnecting in 5s");
                    }
                }
                health.mark_disconnected();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    // ── 6. Aggregator ────────────────────────────────────────────────────
    let aggregator = Aggregator::new(
        Arc::clone(&config),
        Arc::clone(&hot_state),
        Arc::clone(&stats),
        obs_tx,
    );
    tokio::spawn(run_aggregator(
        aggregator,
        event_rx,
        commit_rx,
        shutdown_rx.clone(),
    ));

    // ── 7. Gap detector ──────────────────────────────────────────────────
    let detector = GapDetector::new(Arc::clone(&config));
    tokio::spawn(run_gap_detector(
        detector,
        obs_rx,
        Arc::clone(&coordinator),
        Arc::clone(&feed_health),
        Arc::clone(&stats),
        shutdown_rx.clone(),
    ));

    // ── 8. Inference tick ────────────────────────────────────────────────
    let sink: Arc<dyn PredictionSink> = Arc::new(LogSink);
    let engine = InferenceEngine::new(
        Arc::clone(&config),
        Arc::clone(&hot_state),
        predictor,
        sink,
        Arc::clone(&recovery),
        Arc::clone(&stats),
    );
    tokio::spawn(engine.run(shutdown_rx.clone()));

    // ── 9. Periodic status log ───────────────────────────────────────────
    {
        let stats = Arc::clone(&stats);
        let hot_state = Arc::clone(&hot_state);
        let recovery = Arc::clone(&recovery);
        let interval = config.status_log_interval();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let s = stats.snapshot();
                        info!(
                            events = s.events_processed,
                            malformed = s.malformed_events,
                            gaps = s.gaps_detected,
                            gaps_suppressed = s.gaps_suppressed,
                            reanchors_ok = s.reanchor_successes,
                            reanchors_failed = s.reanchor_failures,
                            predictions = s.predictions_emitted,
                            degraded_predictions = s.predictions_degraded,
                            revision = hot_state.revision(),
                            recovery_degraded = recovery.is_degraded(),
                            "pipeline status"
                        );
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);
    // Grace period: aggregator drains, re-anchor abandons, tick skips.
    tokio::time::sleep(Duration::from_millis(500)).await;

    info!("Borealis Prediction Engine shut down complete.");
    Ok(())
}
