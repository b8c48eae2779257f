use rust_decimal::Decimal;

use crate::api::DataSource;
use crate::channel::ChannelStatus;
use crate::state::{AuctionPhase, UserId};

/// What an auction watch emits to its consumer. Every variant corresponds to
/// an observable change of the shared `AuctionState`; the state is updated
/// before the event is sent.
#[derive(Debug, Clone, PartialEq)]
pub enum AuctionEvent {
    /// Initial item and bid history loaded; the watch is live.
    Loaded,

    /// The initial load keeps failing; still retrying in the background.
    LoadFailed { attempts: u32 },

    /// The auction moved between Upcoming, Active and Ended.
    PhaseChanged(AuctionPhase),

    /// The highest bid advanced, via channel, REST refresh or our own
    /// submission.
    BidUpdated {
        amount: Decimal,
        user_id: Option<UserId>,
    },

    /// The live channel changed connection state.
    ChannelStatus(ChannelStatus),

    /// REST reachability flipped between live and degraded.
    SourceChanged(DataSource),

    /// A malformed channel frame was dropped; `total` is the running count.
    MessageDropped { total: u64 },
}
