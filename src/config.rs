// =============================================================================
// Pipeline Configuration — immutable engine settings loaded at startup
// =============================================================================
//
// Central configuration for the Borealis prediction engine. The struct is
// built once in main and passed to every task behind an Arc; nothing mutates
// it afterwards.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_feed_url() -> String {
    "wss://stream.binance.com:9443/stream".to_string()
}

fn default_snapshot_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_model_path() -> String {
    "model/btcusdt_10s.json".to_string()
}

fn default_tick_period_ms() -> u64 {
    2_000
}

fn default_feature_interval_ms() -> u64 {
    2_000
}

fn default_stale_threshold_ms() -> u64 {
    5_000
}

fn default_min_completeness() -> f64 {
    0.8
}

fn default_rolling_windows_ms() -> Vec<u64> {
    vec![1_000, 5_000]
}

fn default_orderbook_levels() -> usize {
    10
}

fn default_quote_move_threshold_pct() -> f64 {
    0.0005
}

fn default_sequence_gap_k() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_silence_timeout_ms() -> u64 {
    5_000
}

fn default_price_jump_pct() -> f64 {
    0.01
}

fn default_connection_loss_ms() -> u64 {
    30_000
}

fn default_reanchor_max_attempts() -> u32 {
    5
}

fn default_reanchor_backoff_initial_ms() -> u64 {
    1_000
}

fn default_reanchor_backoff_max_ms() -> u64 {
    60_000
}

fn default_reanchor_total_deadline_ms() -> u64 {
    10_000
}

fn default_reanchor_lease_ttl_ms() -> u64 {
    15_000
}

fn default_recovery_cooldown_ms() -> u64 {
    300_000
}

fn default_sanity_price_deviation() -> f64 {
    0.10
}

fn default_status_log_interval_ms() -> u64 {
    30_000
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Top-level configuration for the Borealis engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    // --- Instrument & endpoints ---------------------------------------------

    /// Symbol this process serves. One process per symbol.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// WebSocket endpoint of the live event feed.
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// REST base URL of the snapshot source.
    #[serde(default = "default_snapshot_base_url")]
    pub snapshot_base_url: String,

    /// Path to the pretrained model artifact (JSON).
    #[serde(default = "default_model_path")]
    pub model_path: String,

    // --- Inference ----------------------------------------------------------

    /// Prediction tick period.
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,

    /// Feature staleness gate: above this age a degraded prediction is emitted.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,

    /// Feature completeness gate, in [0, 1].
    #[serde(default = "default_min_completeness")]
    pub min_completeness: f64,

    // --- Aggregation --------------------------------------------------------

    /// Minimum wall-clock interval between feature recomputes.
    #[serde(default = "default_feature_interval_ms")]
    pub feature_interval_ms: u64,

    /// Rolling trade-statistics windows. The engine maintains one window per
    /// entry; the canonical set is {1000, 5000}.
    #[serde(default = "default_rolling_windows_ms")]
    pub rolling_windows_ms: Vec<u64>,

    /// Book depth retained per side.
    #[serde(default = "default_orderbook_levels")]
    pub orderbook_levels: usize,

    /// Relative best-quote move that forces an immediate feature recompute.
    #[serde(default = "default_quote_move_threshold_pct")]
    pub quote_move_threshold_pct: f64,

    // --- Gap detection ------------------------------------------------------

    /// Consecutive sequence-gapped events required before declaring a gap.
    #[serde(default = "default_sequence_gap_k")]
    pub sequence_gap_k: u32,

    /// Whether depth-id continuity violations trigger a re-anchor.
    #[serde(default = "default_true")]
    pub depth_gap_enabled: bool,

    /// Stream silence threshold.
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,

    /// Relative price change between consecutive trades declared a jump.
    #[serde(default = "default_price_jump_pct")]
    pub price_jump_pct: f64,

    /// Transport down for longer than this is a critical discontinuity.
    #[serde(default = "default_connection_loss_ms")]
    pub connection_loss_ms: u64,

    // --- Re-anchor ----------------------------------------------------------

    /// Consecutive failed attempts before the coordinator latches DEGRADED.
    #[serde(default = "default_reanchor_max_attempts")]
    pub reanchor_max_attempts: u32,

    /// Initial retry backoff after a failed attempt.
    #[serde(default = "default_reanchor_backoff_initial_ms")]
    pub reanchor_backoff_initial_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_reanchor_backoff_max_ms")]
    pub reanchor_backoff_max_ms: u64,

    /// Total wall-clock budget for one attempt (fetch + build + validate).
    #[serde(default = "default_reanchor_total_deadline_ms")]
    pub reanchor_total_deadline_ms: u64,

    /// Lease auto-expiry. Must exceed the attempt deadline.
    #[serde(default = "default_reanchor_lease_ttl_ms")]
    pub reanchor_lease_ttl_ms: u64,

    /// Suppression window after a successful re-anchor.
    #[serde(default = "default_recovery_cooldown_ms")]
    pub recovery_cooldown_ms: u64,

    /// Shadow-bundle sanity bound: max relative deviation of the rebuilt mid
    /// from the last known mid.
    #[serde(default = "default_sanity_price_deviation")]
    pub sanity_price_deviation: f64,

    // --- Operations ---------------------------------------------------------

    /// Interval of the periodic status log line.
    #[serde(default = "default_status_log_interval_ms")]
    pub status_log_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            feed_url: default_feed_url(),
            snapshot_base_url: default_snapshot_base_url(),
            model_path: default_model_path(),
            tick_period_ms: default_tick_period_ms(),
            stale_threshold_ms: default_stale_threshold_ms(),
            min_completeness: default_min_completeness(),
            feature_interval_ms: default_feature_interval_ms(),
            rolling_windows_ms: default_rolling_windows_ms(),
            orderbook_levels: default_orderbook_levels(),
            quote_move_threshold_pct: default_quote_move_threshold_pct(),
            sequence_gap_k: default_sequence_gap_k(),
            depth_gap_enabled: true,
            silence_timeout_ms: default_silence_timeout_ms(),
            price_jump_pct: default_price_jump_pct(),
            connection_loss_ms: default_connection_loss_ms(),
            reanchor_max_attempts: default_reanchor_max_attempts(),
            reanchor_backoff_initial_ms: default_reanchor_backoff_initial_ms(),
            reanchor_backoff_max_ms: default_reanchor_backoff_max_ms(),
            reanchor_total_deadline_ms: default_reanchor_total_deadline_ms(),
            reanchor_lease_ttl_ms: default_reanchor_lease_ttl_ms(),
            recovery_cooldown_ms: default_recovery_cooldown_ms(),
            sanity_price_deviation: default_sanity_price_deviation(),
            status_log_interval_ms: default_status_log_interval_ms(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            tick_period_ms = config.tick_period_ms,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise pipeline config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "pipeline config saved (atomic)");
        Ok(())
    }

    // ── Duration helpers ────────────────────────────────────────────────

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn feature_interval(&self) -> Duration {
        Duration::from_millis(self.feature_interval_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn connection_loss(&self) -> Duration {
        Duration::from_millis(self.connection_loss_ms)
    }

    pub fn reanchor_total_deadline(&self) -> Duration {
        Duration::from_millis(self.reanchor_total_deadline_ms)
    }

    pub fn reanchor_lease_ttl(&self) -> Duration {
        Duration::from_millis(self.reanchor_lease_ttl_ms)
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_millis(self.recovery_cooldown_ms)
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_millis(self.status_log_interval_ms)
    }

    /// Backoff delay before retry `attempt` (1-based): exponential doubling
    /// from the initial value, capped at the configured ceiling.
    pub fn reanchor_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .reanchor_backoff_initial_ms
            .saturating_mul(1u64 << exp)
            .min(self.reanchor_backoff_max_ms);
        Duration::from_millis(ms)
    }
}
