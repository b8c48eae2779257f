mod auction;
mod item;
mod phase;

pub use auction::{AuctionState, DEFAULT_HISTORY_LIMIT};
pub use item::{parse_timestamp, AuctionItem, Bid, ItemId, UserId, WireBid, WireItem};
pub use phase::AuctionPhase;
