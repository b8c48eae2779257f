use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::FetchError;

pub type ItemId = u64;
pub type UserId = u64;

/// A biddable item as the client understands it.
#[derive(Debug, Clone, PartialEq)]
pub struct AuctionItem {
    pub item_id: ItemId,
    pub name: String,
    /// Fixed at creation; bids must always exceed it.
    pub start_price: Decimal,
    /// Highest accepted bid. Never decreases once set.
    pub current_bid: Option<Decimal>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub owner_id: Option<UserId>,
    /// Leading bidder while active, winner once ended.
    pub winner_id: Option<UserId>,
}

impl AuctionItem {
    /// Exclusive floor for the next bid: the current bid if any,
    /// otherwise the start price.
    pub fn minimum_next_bid(&self) -> Decimal {
        self.current_bid.unwrap_or(self.start_price).max(self.start_price)
    }
}

/// A single accepted bid. The REST history endpoint only exposes an email
/// label for the bidder, so the numeric id is optional; live echoes carry it.
#[derive(Debug, Clone, PartialEq)]
pub struct Bid {
    pub item_id: ItemId,
    pub user_id: Option<UserId>,
    pub bidder: Option<String>,
    pub amount: Decimal,
    pub placed_at: DateTime<Utc>,
}

/// Item as the server serializes it.
#[derive(Debug, Deserialize)]
pub struct WireItem {
    pub item_id: ItemId,
    pub name: String,
    pub start_price: Decimal,
    pub current_bid: Option<Decimal>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// Server-side boolean status. A hint only; phase is derived from the
    /// timestamps because the server is inconsistent about this field.
    pub status: Option<bool>,
    pub user_id: Option<UserId>,
    pub won_by: Option<UserId>,
}

impl WireItem {
    pub fn into_item(self) -> Result<AuctionItem, FetchError> {
        let start_time = self
            .start_time
            .as_deref()
            .and_then(parse_timestamp)
            .ok_or_else(|| FetchError::Decode(format!("item {} has no start_time", self.item_id)))?;
        let end_time = self
            .end_time
            .as_deref()
            .and_then(parse_timestamp)
            .ok_or_else(|| FetchError::Decode(format!("item {} has no end_time", self.item_id)))?;

        Ok(AuctionItem {
            item_id: self.item_id,
            name: self.name,
            start_price: self.start_price,
            current_bid: self.current_bid,
            start_time,
            end_time,
            owner_id: self.user_id,
            winner_id: self.won_by,
        })
    }
}

/// Entry of the bid-history endpoint.
#[derive(Debug, Deserialize)]
pub struct WireBid {
    pub user_email: Option<String>,
    pub bid_amount: Decimal,
    pub timestamp: Option<String>,
}

impl WireBid {
    pub fn into_bid(self, item_id: ItemId) -> Bid {
        Bid {
            item_id,
            user_id: None,
            bidder: self.user_email,
            amount: self.bid_amount,
            placed_at: self
                .timestamp
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
        }
    }
}

/// The server emits ISO-8601 timestamps, sometimes without an offset
/// (`datetime.isoformat()` on naive values). Naive timestamps are read as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_timestamp_naive_and_offset() {
        let naive = parse_timestamp("2025-04-29T18:00:00").unwrap();
        assert_eq!(naive, Utc.with_ymd_and_hms(2025, 4, 29, 18, 0, 0).unwrap());

        let offset = parse_timestamp("2025-04-29T18:00:00+02:00").unwrap();
        assert_eq!(offset, Utc.with_ymd_and_hms(2025, 4, 29, 16, 0, 0).unwrap());

        let fractional = parse_timestamp("2025-04-29T18:00:00.250").unwrap();
        assert_eq!(fractional.timestamp_subsec_millis(), 250);

        assert!(parse_timestamp("not a timestamp").is_none());
    }

    #[test]
    fn test_wire_item_conversion() {
        let wire = WireItem {
            item_id: 7,
            name: "Antique Vase".to_string(),
            start_price: dec!(100),
            current_bid: Some(dec!(500)),
            start_time: Some("2025-04-29T10:00:00".to_string()),
            end_time: Some("2025-04-29T18:00:00".to_string()),
            status: Some(true),
            user_id: Some(1),
            won_by: Some(3),
        };

        let item = wire.into_item().unwrap();
        assert_eq!(item.item_id, 7);
        assert_eq!(item.current_bid, Some(dec!(500)));
        assert_eq!(item.winner_id, Some(3));
        assert_eq!(item.minimum_next_bid(), dec!(500));
    }

    #[test]
    fn test_wire_item_missing_times_rejected() {
        let wire = WireItem {
            item_id: 7,
            name: "Broken".to_string(),
            start_price: dec!(100),
            current_bid: None,
            start_time: None,
            end_time: Some("2025-04-29T18:00:00".to_string()),
            status: None,
            user_id: None,
            won_by: None,
        };
        assert!(wire.into_item().is_err());
    }

    #[test]
    fn test_minimum_next_bid_without_bids() {
        let wire = WireItem {
            item_id: 1,
            name: "Vintage Watch".to_string(),
            start_price: dec!(300),
            current_bid: None,
            start_time: Some("2025-04-29T09:00:00".to_string()),
            end_time: Some("2025-04-30T20:00:00".to_string()),
            status: None,
            user_id: None,
            won_by: None,
        };
        let item = wire.into_item().unwrap();
        assert_eq!(item.minimum_next_bid(), dec!(300));
    }
}
