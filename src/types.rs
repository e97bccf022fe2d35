// =============================================================================
// Shared types — the decoded event stream consumed by the aggregator
// =============================================================================
//
// Events arrive already decoded and correctly scaled; this module defines the
// tagged sum type they are carried in and the schema checks that gate entry
// into the hot path. An event that fails validation is a MalformedEvent and
// never mutates state.

use serde::{Deserialize, Serialize};

use crate::error::MalformedEvent;

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Discriminant of a [`MarketEvent`], used in observations and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Trade,
    BestBidAsk,
    DepthDiff,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trade => write!(f, "trade"),
            Self::BestBidAsk => write!(f, "best_bid_ask"),
            Self::DepthDiff => write!(f, "depth_diff"),
        }
    }
}

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

/// A single executed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub event_ts_us: i64,
    pub trade_id: u64,
    pub price: f64,
    pub size: f64,
    /// True when the buyer was the resting (maker) side, i.e. the taker sold.
    pub buyer_is_maker: bool,
    pub seq_id: u64,
}

impl TradeEvent {
    /// Taker-buy flag: seller was the maker.
    pub fn is_taker_buy(&self) -> bool {
        !self.buyer_is_maker
    }
}

/// Top-of-book quote update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestBidAskEvent {
    pub event_ts_us: i64,
    pub bid_px: f64,
    pub bid_sz: f64,
    pub ask_px: f64,
    pub ask_sz: f64,
    pub seq_id: u64,
}

/// One price-level delta inside a depth diff. `size == 0` removes the level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LevelDelta {
    pub price: f64,
    pub size: f64,
}

/// Incremental depth update covering update ids `first_update_id..=final_update_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthDiffEvent {
    pub event_ts_us: i64,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<LevelDelta>,
    pub asks: Vec<LevelDelta>,
    pub seq_id: u64,
}

/// Decoded exchange event, logically ordered within a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent {
    Trade(TradeEvent),
    BestBidAsk(BestBidAskEvent),
    DepthDiff(DepthDiffEvent),
}

impl MarketEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Trade(_) => EventKind::Trade,
            Self::BestBidAsk(_) => EventKind::BestBidAsk,
            Self::DepthDiff(_) => EventKind::DepthDiff,
        }
    }

    pub fn seq_id(&self) -> u64 {
        match self {
            Self::Trade(e) => e.seq_id,
            Self::BestBidAsk(e) => e.seq_id,
            Self::DepthDiff(e) => e.seq_id,
        }
    }

    pub fn event_ts_us(&self) -> i64 {
        match self {
            Self::Trade(e) => e.event_ts_us,
            Self::BestBidAsk(e) => e.event_ts_us,
            Self::DepthDiff(e) => e.event_ts_us,
        }
    }

    /// Schema check. Rejects missing/non-finite numerics before any state
    /// mutation happens.
    pub fn validate(&self) -> Result<(), MalformedEvent> {
        fn finite(v: f64, name: &'static str) -> Result<(), MalformedEvent> {
            if v.is_finite() {
                Ok(())
            } else {
                Err(MalformedEvent::NonFinite(name))
            }
        }

        match self {
            Self::Trade(e) => {
                finite(e.price, "trade.price")?;
                finite(e.size, "trade.size")?;
                if e.price <= 0.0 {
                    return Err(MalformedEvent::NonPositive("trade.price"));
                }
                if e.size <= 0.0 {
                    return Err(MalformedEvent::NonPositive("trade.size"));
                }
                if e.event_ts_us <= 0 {
                    return Err(MalformedEvent::NonPositive("trade.event_ts_us"));
                }
                Ok(())
            }
            Self::BestBidAsk(e) => {
                finite(e.bid_px, "bba.bid_px")?;
                finite(e.bid_sz, "bba.bid_sz")?;
                finite(e.ask_px, "bba.ask_px")?;
                finite(e.ask_sz, "bba.ask_sz")?;
                if e.bid_px <= 0.0 {
                    return Err(MalformedEvent::NonPositive("bba.bid_px"));
                }
                if e.ask_px <= 0.0 {
                    return Err(MalformedEvent::NonPositive("bba.ask_px"));
                }
                if e.bid_sz < 0.0 {
                    return Err(MalformedEvent::NonPositive("bba.bid_sz"));
                }
                if e.ask_sz < 0.0 {
                    return Err(MalformedEvent::NonPositive("bba.ask_sz"));
                }
                Ok(())
            }
            Self::DepthDiff(e) => {
                if e.final_update_id < e.first_update_id {
                    return Err(MalformedEvent::InvertedUpdateRange {
                        first: e.first_update_id,
                        last: e.final_update_id,
                    });
                }
                for d in e.bids.iter().chain(e.asks.iter()) {
                    finite(d.price, "depth.price")?;
                    finite(d.size, "depth.size")?;
                    if d.price <= 0.0 {
                        return Err(MalformedEvent::NonPositive("depth.price"));
                    }
                    if d.size < 0.0 {
                        return Err(MalformedEvent::NonPositive("depth.size"));
                    }
                }
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stream observations (aggregator -> gap detector)
// ---------------------------------------------------------------------------

/// Per-event digest the aggregator forwards to the gap detector after
/// processing. Carries everything the continuity rules need without the
/// detector touching hot state.
#[derive(Debug, Clone)]
pub struct StreamObservation {
    pub seq_id: u64,
    pub event_ts_us: i64,
    pub kind: EventKind,
    /// Trade price, for the price-jump rule. Only set on trade events.
    pub trade_price: Option<f64>,
    /// Depth continuity violation observed by the book:
    /// (expected first id, actual first id).
    pub depth_gap: Option<(u64, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade() -> MarketEvent {
        MarketEvent::Trade(TradeEvent {
            event_ts_us: 1_000_000,
            trade_id: 1,
            price: 100.0,
            size: 0.5,
            buyer_is_maker: false,
            seq_id: 1,
        })
    }

    #[test]
    fn valid_trade_passes() {
        assert!(sample_trade().validate().is_ok());
    }

    #[test]
    fn non_finite_price_rejected() {
        let ev = MarketEvent::Trade(TradeEvent {
            event_ts_us: 1_000_000,
            trade_id: 1,
            price: f64::NAN,
            size: 0.5,
            buyer_is_maker: false,
            seq_id: 1,
        });
        assert_eq!(ev.validate(), Err(MalformedEvent::NonFinite("trade.price")));
    }

    #[test]
    fn zero_size_trade_rejected() {
        let ev = MarketEvent::Trade(TradeEvent {
            event_ts_us: 1_000_000,
            trade_id: 1,
            price: 100.0,
            size: 0.0,
            buyer_is_maker: true,
            seq_id: 1,
        });
        assert_eq!(ev.validate(), Err(MalformedEvent::NonPositive("trade.size")));
    }

    #[test]
    fn inverted_depth_range_rejected() {
        let ev = MarketEvent::DepthDiff(DepthDiffEvent {
            event_ts_us: 1_000_000,
            first_update_id: 10,
            final_update_id: 5,
            bids: vec![],
            asks: vec![],
            seq_id: 3,
        });
        assert!(matches!(
            ev.validate(),
            Err(MalformedEvent::InvertedUpdateRange { first: 10, last: 5 })
        ));
    }

    #[test]
    fn depth_zero_size_is_a_removal_not_an_error() {
        let ev = MarketEvent::DepthDiff(DepthDiffEvent {
            event_ts_us: 1_000_000,
            first_update_id: 5,
            final_update_id: 6,
            bids: vec![LevelDelta { price: 99.0, size: 0.0 }],
            asks: vec![],
            seq_id: 3,
        });
        assert!(ev.validate().is_ok());
    }

    #[test]
    fn taker_side_derivation() {
        if let MarketEvent::Trade(t) = sample_trade() {
            assert!(t.is_taker_buy());
        }
    }

    #[test]
    fn accessors_cover_all_kinds() {
        let ev = MarketEvent::BestBidAsk(BestBidAskEvent {
            event_ts_us: 42,
            bid_px: 99.0,
            bid_sz: 1.0,
            ask_px: 99.5,
            ask_sz: 1.0,
            seq_id: 9,
        });
        assert_eq!(ev.kind(), EventKind::BestBidAsk);
        assert_eq!(ev.seq_id(), 9);
        assert_eq!(ev.event_ts_us(), 42);
    }
}
