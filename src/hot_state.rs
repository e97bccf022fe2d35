// =============================================================================
// Hot State — revision-swapped bundle shared by writer and readers
// =============================================================================
//
// The store is a single atomic pointer to an immutable bundle
// {order book, 1s stats, 5s stats, feature vector, revision}. Readers load
// the pointer and get a coherent revision in O(1) without ever blocking the
// writer. The writer (aggregator in steady state, re-anchor coordinator
// during a rebuild commit) copies the current bundle, mutates the copy and
// swaps the pointer.
//
// Steady-state writes keep the revision number; `substitute` is the only
// operation that bumps it, and the only one whose atomicity spans all four
// entities. A re-anchor lease (token + TTL) serialises rebuild attempts; a
// reader never observes an empty or partial store once the first revision
// exists.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::HotStateError;
use crate::market_data::{FeatureVector, OrderBook, TradeStats};

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// One hot-state revision. Immutable once published.
#[derive(Debug, Clone, Serialize)]
pub struct StateBundle {
    pub revision: u64,
    pub order_book: OrderBook,
    pub trades_1s: TradeStats,
    pub trades_5s: TradeStats,
    pub features: FeatureVector,
}

impl StateBundle {
    /// Seed bundle for the very first writer mutation.
    fn initial(symbol: &str, max_levels: usize) -> Self {
        Self {
            revision: 0,
            order_book: OrderBook::new(symbol, max_levels),
            trades_1s: TradeStats::empty(1_000, 0),
            trades_5s: TradeStats::empty(5_000, 0),
            features: FeatureVector::empty(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Exclusive re-anchor permit. Obtained via [`HotState::try_begin_reanchor`],
/// spent on `substitute`/`end_reanchor`.
#[derive(Debug)]
pub struct ReanchorToken {
    id: u64,
}

impl ReanchorToken {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy)]
struct LeaseSlot {
    token_id: u64,
    expires_at: Instant,
}

// ---------------------------------------------------------------------------
// HotState
// ---------------------------------------------------------------------------

/// The shared in-memory store. One instance per symbol.
pub struct HotState {
    symbol: String,
    max_levels: usize,
    bundle: ArcSwapOption<StateBundle>,
    /// Serialises writer-side copy-modify-swap cycles.
    writer: Mutex<()>,
    /// Revision of the currently published bundle (0 = uninitialised).
    revision: AtomicU64,
    lease: Mutex<Option<LeaseSlot>>,
    lease_seq: AtomicU64,
}

impl HotState {
    pub fn new(symbol: impl Into<String>, max_levels: usize) -> Self {
        Self {
            symbol: symbol.into(),
            max_levels,
            bundle: ArcSwapOption::from(None),
            writer: Mutex::new(()),
            revision: AtomicU64::new(0),
            lease: Mutex::new(None),
            lease_seq: AtomicU64::new(0),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    // ── Readers ─────────────────────────────────────────────────────────

    /// Load the current revision. `None` only before the first writer
    /// mutation completes; afterwards this never fails.
    pub fn get(&self) -> Option<Arc<StateBundle>> {
        self.bundle.load_full()
    }

    /// Revision id of the published bundle (0 while uninitialised).
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Advisory flag: a re-anchor lease is currently held and unexpired.
    pub fn reanchor_in_progress(&self) -> bool {
        matches!(*self.lease.lock(), Some(slot) if slot.expires_at > Instant::now())
    }

    // ── Writer ──────────────────────────────────────────────────────────

    /// Run a writer-side mutation. Only the aggregator (steady state) or the
    /// re-anchor coordinator may call this. The mutation is applied to a copy
    /// and swapped in whole, so concurrent readers see either the previous or
    /// the new bundle. Returns the revision the write landed in.
    pub fn apply<F>(&self, mutate: F) -> u64
    where
        F: FnOnce(&mut StateBundle),
    {
        let _writer = self.writer.lock();

        let mut next = match self.bundle.load_full() {
            Some(current) => (*current).clone(),
            None => StateBundle::initial(&self.symbol, self.max_levels),
        };

        let first_write = self.revision.load(Ordering::Acquire) == 0;
        if first_write {
            next.revision = 1;
        }

        mutate(&mut next);
        let revision = next.revision;

        self.bundle.store(Some(Arc::new(next)));
        self.revision.store(revision, Ordering::Release);

        if first_write {
            info!(symbol = %self.symbol, "hot state initialised at revision 1");
        }

        revision
    }

    /// Atomically replace all four entities with the shadow bundle. The sole
    /// cross-entity atomic operation; observable as a single revision bump.
    /// On failure (expired or unknown token) the store is unchanged.
    pub fn substitute(
        &self,
        token: &ReanchorToken,
        order_book: OrderBook,
        trades_1s: TradeStats,
        trades_5s: TradeStats,
        features: FeatureVector,
    ) -> Result<u64, HotStateError> {
        let _writer = self.writer.lock();

        self.check_lease(token)?;

        let revision = self.revision.load(Ordering::Acquire) + 1;
        let next = StateBundle {
            revision,
            order_book,
            trades_1s,
            trades_5s,
            features,
        };

        self.bundle.store(Some(Arc::new(next)));
        self.revision.store(revision, Ordering::Release);

        info!(symbol = %self.symbol, revision, "hot state substituted");
        Ok(revision)
    }

    // ── Lease ───────────────────────────────────────────────────────────

    /// Acquire the single-flight re-anchor lease. `Err(Busy)` when another
    /// unexpired lease exists; callers treat that as a no-op, not a failure.
    pub fn try_begin_reanchor(&self, ttl: Duration) -> Result<ReanchorToken, HotStateError> {
        let mut slot = self.lease.lock();

        if let Some(existing) = *slot {
            if existing.expires_at > Instant::now() {
                return Err(HotStateError::Busy);
            }
            debug!(
                symbol = %self.symbol,
                token = existing.token_id,
                "expired re-anchor lease reclaimed"
            );
        }

        let id = self.lease_seq.fetch_add(1, Ordering::Relaxed) + 1;
        *slot = Some(LeaseSlot {
            token_id: id,
            expires_at: Instant::now() + ttl,
        });

        debug!(symbol = %self.symbol, token = id, "re-anchor lease granted");
        Ok(ReanchorToken { id })
    }

    /// Release the lease. Unknown tokens are a programmer error.
    pub fn end_reanchor(&self, token: ReanchorToken) -> Result<(), HotStateError> {
        let mut slot = self.lease.lock();
        match *slot {
            Some(existing) if existing.token_id == token.id => {
                *slot = None;
                debug!(symbol = %self.symbol, token = token.id, "re-anchor lease released");
                Ok(())
            }
            _ => Err(HotStateError::UnknownToken(token.id)),
        }
    }

    fn check_lease(&self, token: &ReanchorToken) -> Result<(), HotStateError> {
        let slot = self.lease.lock();
        match *slot {
            Some(existing) if existing.token_id == token.id => {
                if existing.expires_at > Instant::now() {
                    Ok(())
                } else {
                    Err(HotStateError::LeaseExpired(token.id))
                }
            }
            _ => Err(HotStateError::UnknownToken(token.id)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn store() -> HotState {
        HotState::new("BTCUSDT", 10)
    }

    /// Stamp all four entities with the same tag so torn reads are detectable.
    fn tagged_write(hs: &HotState, tag: u64) {
        hs.apply(|b| {
            b.order_book.last_update_id = tag;
            b.trades_1s.count = tag;
            b.trades_5s.count = tag;
            b.features.ts_ms = tag as i64;
        });
    }

    fn assert_coherent(bundle: &StateBundle) {
        let tag = bundle.order_book.last_update_id;
        assert_eq!(bundle.trades_1s.count, tag);
        assert_eq!(bundle.trades_5s.count, tag);
        assert_eq!(bundle.features.ts_ms, tag as i64);
    }

    #[test]
    fn uninitialised_store_returns_none() {
        let hs = store();
        assert!(hs.get().is_none());
        assert_eq!(hs.revision(), 0);
    }

    #[test]
    fn first_apply_initialises_revision_one() {
        let hs = store();
        let rev = hs.apply(|b| b.order_book.last_update_id = 7);
        assert_eq!(rev, 1);
        let bundle = hs.get().unwrap();
        assert_eq!(bundle.revision, 1);
        assert_eq!(bundle.order_book.last_update_id, 7);
    }

    #[test]
    fn steady_writes_keep_revision() {
        let hs = store();
        tagged_write(&hs, 1);
        tagged_write(&hs, 2);
        tagged_write(&hs, 3);
        assert_eq!(hs.revision(), 1);
        assert_eq!(hs.get().unwrap().order_book.last_update_id, 3);
    }

    #[test]
    fn substitute_bumps_revision_and_replaces_everything() {
        let hs = store();
        tagged_write(&hs, 5);

        let token = hs.try_begin_reanchor(Duration::from_secs(5)).unwrap();
        let book = OrderBook::from_snapshot(
            "BTCUSDT",
            &[(100.0, 1.0)],
            &[(100.5, 1.0)],
            1_000,
            2_000_000,
            10,
        );
        let rev = hs
            .substitute(
                &token,
                book,
                TradeStats::empty(1_000, 2_000_000),
                TradeStats::empty(5_000, 2_000_000),
                FeatureVector::empty(2_000),
            )
            .unwrap();
        hs.end_reanchor(token).unwrap();

        assert_eq!(rev, 2);
        let bundle = hs.get().unwrap();
        assert_eq!(bundle.revision, 2);
        assert_eq!(bundle.order_book.last_update_id, 1_000);
        assert!(bundle.trades_1s.is_empty());
        assert!(!hs.reanchor_in_progress());
    }

    #[test]
    fn concurrent_lease_requests_grant_exactly_one() {
        let hs = store();
        let first = hs.try_begin_reanchor(Duration::from_secs(5));
        let second = hs.try_begin_reanchor(Duration::from_secs(5));
        assert!(first.is_ok());
        assert_eq!(second.unwrap_err(), HotStateError::Busy);
        hs.end_reanchor(first.unwrap()).unwrap();
        // Released: a new lease is grantable.
        assert!(hs.try_begin_reanchor(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn expired_lease_is_reclaimable_and_rejects_substitute() {
        let hs = store();
        tagged_write(&hs, 1);

        let stale = hs.try_begin_reanchor(Duration::from_millis(1)).unwrap();
        thread::sleep(Duration::from_millis(10));

        // Another attempt can claim the slot now.
        let fresh = hs.try_begin_reanchor(Duration::from_secs(5)).unwrap();

        let book = OrderBook::from_snapshot(
            "BTCUSDT",
            &[(100.0, 1.0)],
            &[(100.5, 1.0)],
            50,
            1_000_000,
            10,
        );
        let before = hs.get().unwrap();
        let err = hs
            .substitute(
                &stale,
                book,
                TradeStats::empty(1_000, 0),
                TradeStats::empty(5_000, 0),
                FeatureVector::empty(0),
            )
            .unwrap_err();
        assert_eq!(err, HotStateError::UnknownToken(stale.id()));

        // Store unchanged on failure.
        let after = hs.get().unwrap();
        assert_eq!(before.revision, after.revision);
        assert_eq!(
            before.order_book.last_update_id,
            after.order_book.last_update_id
        );

        hs.end_reanchor(fresh).unwrap();
    }

    #[test]
    fn end_with_unknown_token_is_rejected() {
        let hs = store();
        let token = hs.try_begin_reanchor(Duration::from_secs(5)).unwrap();
        let id = token.id();
        hs.end_reanchor(token).unwrap();
        // Second release attempt with a forged token id.
        let forged = ReanchorToken { id };
        assert_eq!(
            hs.end_reanchor(forged).unwrap_err(),
            HotStateError::UnknownToken(id)
        );
    }

    #[test]
    fn readers_never_observe_a_torn_bundle() {
        let hs = Arc::new(store());
        tagged_write(&hs, 1);

        let writer = {
            let hs = Arc::clone(&hs);
            thread::spawn(move || {
                for tag in 2..500u64 {
                    tagged_write(&hs, tag);
                    if tag % 100 == 0 {
                        // Interleave substitutes with steady writes.
                        let token = hs.try_begin_reanchor(Duration::from_secs(5)).unwrap();
                        let book = OrderBook::from_snapshot(
                            "BTCUSDT",
                            &[(100.0, 1.0)],
                            &[(100.5, 1.0)],
                            tag,
                            1_000_000,
                            10,
                        );
                        let mut ts1 = TradeStats::empty(1_000, 0);
                        ts1.count = tag;
                        let mut ts5 = TradeStats::empty(5_000, 0);
                        ts5.count = tag;
                        let mut fv = FeatureVector::empty(0);
                        fv.ts_ms = tag as i64;
                        hs.substitute(&token, book, ts1, ts5, fv).unwrap();
                        hs.end_reanchor(token).unwrap();
                    }
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let hs = Arc::clone(&hs);
                thread::spawn(move || {
                    let mut last_revision = 0;
                    for _ in 0..2_000 {
                        let bundle = hs.get().expect("initialised");
                        assert_coherent(&bundle);
                        assert!(bundle.revision >= last_revision, "revision went backwards");
                        last_revision = bundle.revision;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
