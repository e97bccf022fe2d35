// =============================================================================
// Pipeline counters — lock-free operational statistics
// =============================================================================
//
// Counters are plain atomics so the hot path never takes a lock to account
// for an event. The periodic status task snapshots them for logging.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counter block, one per engine instance.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub events_processed: AtomicU64,
    pub malformed_events: AtomicU64,
    pub observations_dropped: AtomicU64,
    pub depth_diffs_ignored: AtomicU64,
    pub feature_recomputes: AtomicU64,
    pub gaps_detected: AtomicU64,
    pub gaps_suppressed: AtomicU64,
    pub reanchor_attempts: AtomicU64,
    pub reanchor_successes: AtomicU64,
    pub reanchor_failures: AtomicU64,
    pub shadow_rejections: AtomicU64,
    pub predictions_emitted: AtomicU64,
    pub predictions_degraded: AtomicU64,
    pub ticks_skipped: AtomicU64,
    pub sink_failures: AtomicU64,
}

/// Point-in-time copy of the counters, for the status log.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub events_processed: u64,
    pub malformed_events: u64,
    pub observations_dropped: u64,
    pub depth_diffs_ignored: u64,
    pub feature_recomputes: u64,
    pub gaps_detected: u64,
    pub gaps_suppressed: u64,
    pub reanchor_attempts: u64,
    pub reanchor_successes: u64,
    pub reanchor_failures: u64,
    pub shadow_rejections: u64,
    pub predictions_emitted: u64,
    pub predictions_degraded: u64,
    pub ticks_skipped: u64,
    pub sink_failures: u64,
}

impl PipelineStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            malformed_events: self.malformed_events.load(Ordering::Relaxed),
            observations_dropped: self.observations_dropped.load(Ordering::Relaxed),
            depth_diffs_ignored: self.depth_diffs_ignored.load(Ordering::Relaxed),
            feature_recomputes: self.feature_recomputes.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            gaps_suppressed: self.gaps_suppressed.load(Ordering::Relaxed),
            reanchor_attempts: self.reanchor_attempts.load(Ordering::Relaxed),
            reanchor_successes: self.reanchor_successes.load(Ordering::Relaxed),
            reanchor_failures: self.reanchor_failures.load(Ordering::Relaxed),
            shadow_rejections: self.shadow_rejections.load(Ordering::Relaxed),
            predictions_emitted: self.predictions_emitted.load(Ordering::Relaxed),
            predictions_degraded: self.predictions_degraded.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = PipelineStats::default();
        PipelineStats::incr(&stats.events_processed);
        PipelineStats::incr(&stats.events_processed);
        PipelineStats::incr(&stats.gaps_detected);

        let snap = stats.snapshot();
        assert_eq!(snap.events_processed, 2);
        assert_eq!(snap.gaps_detected, 1);
        assert_eq!(snap.predictions_emitted, 0);
    }
}
