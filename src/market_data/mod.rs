// =============================================================================
// Market data — order book, rolling trade windows, feature vector
// =============================================================================

pub mod features;
pub mod order_book;
pub mod trade_window;

pub use features::{FeatureVector, MidHistory};
pub use order_book::{DepthApplyOutcome, OrderBook};
pub use trade_window::{TradeStats, TradeWindow, WindowTrade};
