mod rest;

pub use rest::RestClient;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::{BidError, FetchError};
use crate::state::{AuctionItem, Bid, ItemId};

/// Reachability of the backing server, owned by the REST client and flipped
/// on request outcomes. Surfaced on `AuctionState` so consumers can label
/// data as potentially stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Live,
    Degraded,
}

/// Request/response surface of the auction server. The engine only talks to
/// this trait so tests can run against an in-memory implementation.
#[async_trait]
pub trait AuctionApi: Send + Sync {
    async fn fetch_item(&self, item_id: ItemId) -> Result<AuctionItem, FetchError>;

    /// Recent bids for an item, most recent first.
    async fn fetch_bids(&self, item_id: ItemId) -> Result<Vec<Bid>, FetchError>;

    async fn active_items(&self) -> Result<Vec<AuctionItem>, FetchError>;

    /// Submit a bid over REST. Returns the authoritative item after the bid
    /// so the caller can feed it through the normal merge path.
    ///
    /// `request_token` identifies this submission across transports so a
    /// channel send that timed out and its REST fallback cannot both apply.
    async fn place_bid(
        &self,
        item_id: ItemId,
        amount: Decimal,
        request_token: &str,
    ) -> Result<AuctionItem, BidError>;

    fn source(&self) -> DataSource;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory server double for engine tests.
    pub struct FakeApi {
        pub items: Mutex<HashMap<ItemId, AuctionItem>>,
        pub bids: Mutex<Vec<Bid>>,
        pub fetch_calls: AtomicUsize,
        pub place_calls: AtomicUsize,
        /// Number of upcoming fetches that fail before succeeding.
        pub fail_fetches: AtomicUsize,
        /// Forced reply for the next `place_bid`, if any.
        pub reject_with: Mutex<Option<BidError>>,
    }

    impl FakeApi {
        pub fn new(item: AuctionItem) -> Self {
            let mut items = HashMap::new();
            items.insert(item.item_id, item);
            Self {
                items: Mutex::new(items),
                bids: Mutex::new(Vec::new()),
                fetch_calls: AtomicUsize::new(0),
                place_calls: AtomicUsize::new(0),
                fail_fetches: AtomicUsize::new(0),
                reject_with: Mutex::new(None),
            }
        }

        pub fn set_current_bid(&self, item_id: ItemId, amount: Decimal) {
            let mut items = self.items.lock().unwrap();
            if let Some(item) = items.get_mut(&item_id) {
                item.current_bid = Some(amount);
            }
        }
    }

    #[async_trait]
    impl AuctionApi for FakeApi {
        async fn fetch_item(&self, item_id: ItemId) -> Result<AuctionItem, FetchError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_fetches
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FetchError::Status {
                    status: 503,
                    message: None,
                });
            }
            self.items
                .lock()
                .unwrap()
                .get(&item_id)
                .cloned()
                .ok_or(FetchError::Status {
                    status: 404,
                    message: None,
                })
        }

        async fn fetch_bids(&self, item_id: ItemId) -> Result<Vec<Bid>, FetchError> {
            Ok(self
                .bids
                .lock()
                .unwrap()
                .iter()
                .filter(|b| b.item_id == item_id)
                .cloned()
                .collect())
        }

        async fn active_items(&self) -> Result<Vec<AuctionItem>, FetchError> {
            Ok(self.items.lock().unwrap().values().cloned().collect())
        }

        async fn place_bid(
            &self,
            item_id: ItemId,
            amount: Decimal,
            _request_token: &str,
        ) -> Result<AuctionItem, BidError> {
            self.place_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.reject_with.lock().unwrap().take() {
                return Err(err);
            }
            let mut items = self.items.lock().unwrap();
            let item = items.get_mut(&item_id).ok_or(BidError::Fetch(FetchError::Status {
                status: 404,
                message: None,
            }))?;
            if amount <= item.minimum_next_bid() {
                return Err(BidError::Outbid {
                    current_bid: item.current_bid,
                });
            }
            item.current_bid = Some(amount);
            Ok(item.clone())
        }

        fn source(&self) -> DataSource {
            DataSource::Live
        }
    }
}
