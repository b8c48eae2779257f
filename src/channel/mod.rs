mod manager;
pub(crate) mod transport;

pub use manager::{ChannelConfig, ChannelManager, Subscription};
pub use transport::{ChannelTransport, TransportLink, WsTransport};

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::state::{AuctionItem, ItemId, UserId, WireItem};

/// Connection state of one live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

/// Address of a channel: one per watched item plus one global broadcast of
/// all active items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelKey {
    ActiveItems,
    Item(ItemId),
}

impl ChannelKey {
    fn path(&self) -> String {
        match self {
            ChannelKey::ActiveItems => "/ws/active-items".to_string(),
            ChannelKey::Item(item_id) => format!("/ws/bid/{item_id}"),
        }
    }
}

/// Parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// A bid was accepted, broadcast to everyone watching the item.
    BidAccepted {
        item_id: ItemId,
        amount: Decimal,
        user_id: UserId,
    },
    /// Our own submission was rejected.
    BidRejected {
        message: String,
        kind: Option<String>,
        current_bid: Option<Decimal>,
    },
    /// Snapshot broadcast on the active-items channel.
    ActiveItems(Vec<AuctionItem>),
    /// The server declared the auction closed before its end time.
    AuctionClosed { item_id: Option<ItemId> },
}

/// What subscribers receive, strictly in arrival order per channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(InboundMessage),
    Status(ChannelStatus),
    /// An inbound frame that matched no known shape was dropped.
    Malformed,
}

// The server sends objects with different key sets depending on outcome;
// deserialize everything as optional and classify afterwards.
#[derive(Debug, Deserialize)]
struct WireMessage {
    item_id: Option<ItemId>,
    new_bid: Option<Decimal>,
    user_id: Option<UserId>,
    error: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    current_bid: Option<Decimal>,
    status: Option<String>,
}

pub(crate) fn parse_inbound(text: &str) -> Option<InboundMessage> {
    // Active-items broadcasts are bare arrays.
    if text.trim_start().starts_with('[') {
        let mut bytes = text.as_bytes().to_vec();
        let wire: Vec<WireItem> = simd_json::from_slice(&mut bytes).ok()?;
        let items = wire.into_iter().filter_map(|w| w.into_item().ok()).collect();
        return Some(InboundMessage::ActiveItems(items));
    }

    let mut bytes = text.as_bytes().to_vec();
    let msg: WireMessage = simd_json::from_slice(&mut bytes).ok()?;

    if let Some(error) = msg.error {
        return Some(InboundMessage::BidRejected {
            message: error,
            kind: msg.kind,
            current_bid: msg.current_bid,
        });
    }
    if msg.status.as_deref() == Some("closed") {
        return Some(InboundMessage::AuctionClosed {
            item_id: msg.item_id,
        });
    }
    if let (Some(item_id), Some(amount), Some(user_id)) = (msg.item_id, msg.new_bid, msg.user_id) {
        return Some(InboundMessage::BidAccepted {
            item_id,
            amount,
            user_id,
        });
    }
    None
}
