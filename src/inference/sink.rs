// =============================================================================
// Prediction Sink — best-effort publish seam
// =============================================================================
//
// The tick loop must never block on delivery: a lost prediction is preferred
// over a stalled schedule. Implementations keep publish bounded and cheap.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use super::PredictionRecord;

/// Single-operation publish interface.
#[async_trait]
pub trait PredictionSink: Send + Sync {
    async fn publish(&self, prediction: &PredictionRecord) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Log sink
// ---------------------------------------------------------------------------

/// Emits each prediction as a structured log line. The default sink.
pub struct LogSink;

#[async_trait]
impl PredictionSink for LogSink {
    async fn publish(&self, prediction: &PredictionRecord) -> Result<()> {
        info!(
            symbol = %prediction.symbol,
            tick_ts_ms = prediction.tick_ts_ms,
            current = prediction.current_price,
            predicted = prediction.predicted_price,
            confidence = format!("{:.3}", prediction.confidence),
            source = %prediction.source,
            latency_us = prediction.inference_latency_us,
            "prediction"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Channel sink
// ---------------------------------------------------------------------------

/// Forwards predictions into an mpsc channel. Non-blocking: a full channel
/// drops the prediction and reports the failure.
pub struct ChannelSink {
    tx: mpsc::Sender<PredictionRecord>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<PredictionRecord>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl PredictionSink for ChannelSink {
    async fn publish(&self, prediction: &PredictionRecord) -> Result<()> {
        self.tx
            .try_send(prediction.clone())
            .map_err(|e| anyhow!("prediction channel unavailable: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::PredictionSource;

    fn sample() -> PredictionRecord {
        PredictionRecord {
            prediction_id: "test".into(),
            symbol: "BTCUSDT".into(),
            tick_ts_ms: 1_000,
            current_price: 100.0,
            predicted_price: 100.5,
            target_offset_ms: 10_000,
            confidence: 0.8,
            model_version: "test-1".into(),
            feature_age_ms: 50,
            inference_latency_us: 120,
            source: PredictionSource::Normal,
        }
    }

    #[tokio::test]
    async fn channel_sink_delivers() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ChannelSink::new(tx);
        sink.publish(&sample()).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.symbol, "BTCUSDT");
        assert_eq!(got.source, PredictionSource::Normal);
    }

    #[tokio::test]
    async fn full_channel_fails_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = ChannelSink::new(tx);
        sink.publish(&sample()).await.unwrap();
        // Second publish hits a full channel and errors immediately.
        assert!(sink.publish(&sample()).await.is_err());
    }
}
