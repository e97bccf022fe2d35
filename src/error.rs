// =============================================================================
// Error taxonomies — the disjoint failure kinds of the pipeline
// =============================================================================
//
// Recovery policy per kind:
//   MalformedEvent  -> drop, count, continue (aggregator)
//   Continuity      -> re-anchor, subject to cooldown (detector)
//   SnapshotError   -> retry with backoff up to max attempts (coordinator)
//   HotStateError   -> Busy is a benign no-op; LeaseExpired / UnknownToken
//                      abort the attempt without touching the store
// Fatal conditions (model load failure at startup) surface as plain anyhow
// errors out of main.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Malformed events
// ---------------------------------------------------------------------------

/// A stream event that failed schema validation. Never mutates state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEvent {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("non-finite number in field: {0}")]
    NonFinite(&'static str),

    #[error("non-positive value in field: {0}")]
    NonPositive(&'static str),

    #[error("depth diff with inverted update-id range {first}..{last}")]
    InvertedUpdateRange { first: u64, last: u64 },
}

// ---------------------------------------------------------------------------
// Snapshot source
// ---------------------------------------------------------------------------

/// Categorized failure from the snapshot source (REST depth + trades).
#[derive(Debug, Clone, Error)]
pub enum SnapshotError {
    #[error("snapshot request timed out")]
    Timeout,

    #[error("snapshot source throttled the request")]
    Throttled,

    #[error("symbol not found at snapshot source")]
    NotFound,

    #[error("transient snapshot failure: {0}")]
    Transient(String),

    #[error("permanent snapshot failure: {0}")]
    Permanent(String),
}

impl SnapshotError {
    /// Whether a retry (with backoff) can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Throttled | Self::Transient(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Hot state
// ---------------------------------------------------------------------------

/// Failures from the hot-state lease / substitute surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HotStateError {
    /// Another re-anchor holds the lease. Callers treat this as a no-op.
    #[error("re-anchor lease is busy")]
    Busy,

    /// The lease expired before substitute/end was called.
    #[error("re-anchor lease expired (token {0})")]
    LeaseExpired(u64),

    /// Token does not match the current lease. Programmer error.
    #[error("unknown re-anchor token {0}")]
    UnknownToken(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_retryability() {
        assert!(SnapshotError::Timeout.is_retryable());
        assert!(SnapshotError::Throttled.is_retryable());
        assert!(SnapshotError::Transient("503".into()).is_retryable());
        assert!(!SnapshotError::NotFound.is_retryable());
        assert!(!SnapshotError::Permanent("bad symbol".into()).is_retryable());
    }

    #[test]
    fn error_messages_render() {
        let e = MalformedEvent::MissingField("price");
        assert_eq!(e.to_string(), "missing required field: price");

        let e = HotStateError::LeaseExpired(7);
        assert!(e.to_string().contains("token 7"));
    }
}
