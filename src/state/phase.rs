use chrono::{DateTime, Utc};

use super::item::{AuctionItem, UserId};

/// Derived lifecycle stage of an auction. Never stored server-side; always
/// recomputed from the clock so a stale server `status` flag cannot lie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuctionPhase {
    Upcoming,
    Active,
    Ended { winner: Option<UserId> },
}

impl AuctionPhase {
    pub fn derive(item: &AuctionItem, now: DateTime<Utc>) -> Self {
        if now < item.start_time {
            AuctionPhase::Upcoming
        } else if now < item.end_time {
            AuctionPhase::Active
        } else {
            AuctionPhase::Ended {
                // No bids means no winner, whatever won_by claims.
                winner: item.current_bid.and(item.winner_id),
            }
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AuctionPhase::Active)
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, AuctionPhase::Ended { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn item(start_offset_secs: i64, end_offset_secs: i64) -> AuctionItem {
        let now = Utc::now();
        AuctionItem {
            item_id: 1,
            name: "Antique Vase".to_string(),
            start_price: dec!(100),
            current_bid: None,
            start_time: now + Duration::seconds(start_offset_secs),
            end_time: now + Duration::seconds(end_offset_secs),
            owner_id: None,
            winner_id: None,
        }
    }

    #[test]
    fn test_phase_from_clock() {
        let now = Utc::now();

        assert_eq!(AuctionPhase::derive(&item(60, 120), now), AuctionPhase::Upcoming);
        assert_eq!(AuctionPhase::derive(&item(-60, 60), now), AuctionPhase::Active);
        assert!(AuctionPhase::derive(&item(-120, -60), now).is_ended());
    }

    #[test]
    fn test_ended_winner_requires_a_bid() {
        let now = Utc::now();

        let mut ended = item(-120, -60);
        ended.winner_id = Some(3);
        // won_by without a bid is not a winner
        assert_eq!(
            AuctionPhase::derive(&ended, now),
            AuctionPhase::Ended { winner: None }
        );

        ended.current_bid = Some(dec!(500));
        assert_eq!(
            AuctionPhase::derive(&ended, now),
            AuctionPhase::Ended { winner: Some(3) }
        );
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let mut it = item(0, 60);
        let start = it.start_time;
        assert_eq!(AuctionPhase::derive(&it, start), AuctionPhase::Active);

        it = item(-60, 0);
        let end = it.end_time;
        assert!(AuctionPhase::derive(&it, end).is_ended());
    }
}
