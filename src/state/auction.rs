use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::api::DataSource;
use crate::channel::ChannelStatus;

use super::item::{AuctionItem, Bid};
use super::phase::AuctionPhase;

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// The single authoritative view of one watched auction: item data, recent
/// bids, derived phase and the health of the feeds updating it.
///
/// Channel messages and REST refreshes both land here through the same
/// merge rule, so arrival order and duplication never matter - only the
/// highest amount does.
#[derive(Debug, Clone, PartialEq)]
pub struct AuctionState {
    pub item: AuctionItem,
    /// Most recent first, capped.
    pub bids: Vec<Bid>,
    pub phase: AuctionPhase,
    pub channel: ChannelStatus,
    pub source: DataSource,
    /// Malformed inbound messages dropped so far (diagnostics).
    pub dropped_messages: u64,
    history_limit: usize,
}

impl AuctionState {
    pub fn new(item: AuctionItem, mut bids: Vec<Bid>, now: DateTime<Utc>, history_limit: usize) -> Self {
        bids.truncate(history_limit);
        let phase = AuctionPhase::derive(&item, now);
        Self {
            item,
            bids,
            phase,
            channel: ChannelStatus::Closed,
            source: DataSource::Live,
            dropped_messages: 0,
            history_limit,
        }
    }

    pub fn minimum_next_bid(&self) -> Decimal {
        self.item.minimum_next_bid()
    }

    /// The one reconciliation rule: keep the maximum of the known and the
    /// incoming amount. Lower or equal amounts are stale or duplicate and
    /// leave the state untouched.
    fn merge_amount(&mut self, amount: Decimal) -> bool {
        if amount <= self.item.minimum_next_bid() {
            return false;
        }
        self.item.current_bid = Some(amount);
        true
    }

    /// Merge an accepted bid from the live channel (or a synthesized echo).
    /// Returns true when it advanced the state.
    pub fn apply_bid(&mut self, bid: Bid) -> bool {
        if !self.merge_amount(bid.amount) {
            return false;
        }
        if bid.user_id.is_some() {
            self.item.winner_id = bid.user_id;
        }
        self.bids.insert(0, bid);
        self.bids.truncate(self.history_limit);
        true
    }

    /// Merge an authoritative amount without a history entry, e.g. the
    /// current bid attached to a rejection.
    pub fn observe_bid_amount(&mut self, amount: Decimal) -> bool {
        self.merge_amount(amount)
    }

    /// Merge a REST refresh of the item. `current_bid` only ever moves up;
    /// metadata tracks the server, and the winner is filled in when we have
    /// none yet. Returns true when the bid advanced.
    pub fn refresh_item(&mut self, fresh: AuctionItem) -> bool {
        let advanced = match fresh.current_bid {
            Some(amount) => self.merge_amount(amount),
            None => false,
        };
        if advanced {
            self.item.winner_id = fresh.winner_id.or(self.item.winner_id);
        } else if self.item.winner_id.is_none() {
            self.item.winner_id = fresh.winner_id;
        }
        self.item.name = fresh.name;
        self.item.start_time = fresh.start_time;
        self.item.end_time = fresh.end_time;
        self.item.owner_id = fresh.owner_id.or(self.item.owner_id);
        advanced
    }

    /// Re-derive the phase from the clock. Returns the new phase when it
    /// changed.
    pub fn recompute_phase(&mut self, now: DateTime<Utc>) -> Option<AuctionPhase> {
        let phase = AuctionPhase::derive(&self.item, now);
        if phase != self.phase {
            self.phase = phase;
            Some(phase)
        } else {
            None
        }
    }

    /// Force the terminal phase, e.g. when the server signals closure before
    /// the local clock reaches `end_time`.
    pub fn force_ended(&mut self) -> AuctionPhase {
        let winner = self.item.current_bid.and(self.item.winner_id);
        self.phase = AuctionPhase::Ended { winner };
        self.phase
    }

    pub fn record_dropped(&mut self) -> u64 {
        self.dropped_messages += 1;
        self.dropped_messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::item::ItemId;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn active_item() -> AuctionItem {
        let now = Utc::now();
        AuctionItem {
            item_id: 1,
            name: "Antique Vase".to_string(),
            start_price: dec!(100),
            current_bid: None,
            start_time: now - Duration::minutes(5),
            end_time: now + Duration::minutes(5),
            owner_id: Some(1),
            winner_id: None,
        }
    }

    fn bid(item_id: ItemId, user: u64, amount: Decimal) -> Bid {
        Bid {
            item_id,
            user_id: Some(user),
            bidder: None,
            amount,
            placed_at: Utc::now(),
        }
    }

    fn state() -> AuctionState {
        AuctionState::new(active_item(), Vec::new(), Utc::now(), DEFAULT_HISTORY_LIMIT)
    }

    #[test]
    fn test_merge_is_order_independent() {
        // Same amounts, three arrival orders, one of them with a duplicate.
        let sequences: &[&[Decimal]] = &[
            &[dec!(150), dec!(120), dec!(200), dec!(180)],
            &[dec!(200), dec!(150), dec!(180), dec!(120)],
            &[dec!(120), dec!(120), dec!(150), dec!(200), dec!(200), dec!(180)],
        ];

        for amounts in sequences {
            let mut s = state();
            for (i, &amount) in amounts.iter().enumerate() {
                s.apply_bid(bid(1, i as u64 + 2, amount));
            }
            assert_eq!(s.item.current_bid, Some(dec!(200)), "sequence {amounts:?}");
        }
    }

    #[test]
    fn test_equal_amount_is_idempotent() {
        let mut s = state();
        assert!(s.apply_bid(bid(1, 2, dec!(150))));
        assert_eq!(s.bids.len(), 1);

        // duplicate echo: no state change, no duplicate history entry
        assert!(!s.apply_bid(bid(1, 2, dec!(150))));
        assert_eq!(s.bids.len(), 1);
        assert_eq!(s.item.current_bid, Some(dec!(150)));
    }

    #[test]
    fn test_bid_must_exceed_start_price() {
        let mut s = state();
        assert!(!s.apply_bid(bid(1, 2, dec!(100))));
        assert!(!s.apply_bid(bid(1, 2, dec!(90))));
        assert_eq!(s.item.current_bid, None);
        assert!(s.bids.is_empty());
    }

    #[test]
    fn test_stale_inbound_ignored() {
        let mut s = state();
        s.apply_bid(bid(1, 2, dec!(150)));
        assert!(!s.apply_bid(bid(1, 3, dec!(120))));
        assert_eq!(s.item.current_bid, Some(dec!(150)));
        assert_eq!(s.item.winner_id, Some(2));
    }

    #[test]
    fn test_refresh_never_lowers_bid() {
        let mut s = state();
        s.apply_bid(bid(1, 2, dec!(500)));

        let mut stale = active_item();
        stale.current_bid = Some(dec!(300));
        assert!(!s.refresh_item(stale));
        assert_eq!(s.item.current_bid, Some(dec!(500)));

        let mut fresh = active_item();
        fresh.current_bid = Some(dec!(800));
        fresh.winner_id = Some(4);
        assert!(s.refresh_item(fresh));
        assert_eq!(s.item.current_bid, Some(dec!(800)));
        assert_eq!(s.item.winner_id, Some(4));
    }

    #[test]
    fn test_history_capped() {
        let mut s = AuctionState::new(active_item(), Vec::new(), Utc::now(), 3);
        for i in 1..=5u64 {
            s.apply_bid(bid(1, i, dec!(100) + Decimal::from(i * 10)));
        }
        assert_eq!(s.bids.len(), 3);
        // most recent first
        assert_eq!(s.bids[0].amount, dec!(150));
    }

    #[test]
    fn test_force_ended_winner() {
        let mut s = state();
        assert_eq!(s.force_ended(), AuctionPhase::Ended { winner: None });

        let mut s = state();
        s.apply_bid(bid(1, 2, dec!(150)));
        assert_eq!(s.force_ended(), AuctionPhase::Ended { winner: Some(2) });
    }

    #[test]
    fn test_recompute_phase_reports_changes_once() {
        let mut s = state();
        let past_end = s.item.end_time + Duration::seconds(1);
        let changed = s.recompute_phase(past_end);
        assert!(matches!(changed, Some(AuctionPhase::Ended { .. })));
        assert_eq!(s.recompute_phase(past_end), None);
    }
}
