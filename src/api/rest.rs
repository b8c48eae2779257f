use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::CredentialProvider;
use crate::error::{BidError, FetchError};
use crate::state::{AuctionItem, Bid, ItemId, WireBid, WireItem};

use super::{AuctionApi, DataSource};

/// Stateless request/response adapter for the auction server. Used for the
/// initial load and as the fallback path whenever the live channel is down.
///
/// Owns the process-wide reachability flag: any completed request marks the
/// source `Live`, any transport-level failure marks it `Degraded`.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    degraded: AtomicBool,
}

/// Error body shape: `{"detail": {"message": ..., "type": ...}}`.
#[derive(Debug, Deserialize)]
struct WireErrorBody {
    detail: Option<WireErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    message: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    current_bid: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct WireBidResponse {
    #[serde(rename = "item details")]
    item: Option<WireItem>,
}

impl RestClient {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
        request_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            credentials,
            degraded: AtomicBool::new(false),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base_url, path));
        // Reads are legal without a credential; attach it when we have one.
        if let Some(token) = self.credentials.credential() {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn set_source(&self, source: DataSource) {
        let degraded = source == DataSource::Degraded;
        if self.degraded.swap(degraded, Ordering::SeqCst) != degraded {
            warn!(?source, "server reachability changed");
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let response = self
            .request(Method::GET, path)
            .send()
            .await
            .map_err(|e| {
                self.set_source(DataSource::Degraded);
                FetchError::Http(e)
            })?;
        self.set_source(DataSource::Live);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

fn status_error(status: StatusCode, body: &str) -> FetchError {
    FetchError::Status {
        status: status.as_u16(),
        message: parse_error_detail(body).and_then(|d| d.message),
    }
}

fn parse_error_detail(body: &str) -> Option<WireErrorDetail> {
    serde_json::from_str::<WireErrorBody>(body).ok()?.detail
}

#[async_trait]
impl AuctionApi for RestClient {
    async fn fetch_item(&self, item_id: ItemId) -> Result<AuctionItem, FetchError> {
        let wire: WireItem = self.get_json(&format!("/get_item_details/{item_id}")).await?;
        wire.into_item()
    }

    async fn fetch_bids(&self, item_id: ItemId) -> Result<Vec<Bid>, FetchError> {
        let wire: Vec<WireBid> = self.get_json(&format!("/item/{item_id}/bids")).await?;
        Ok(wire.into_iter().map(|b| b.into_bid(item_id)).collect())
    }

    async fn active_items(&self) -> Result<Vec<AuctionItem>, FetchError> {
        let wire: Vec<WireItem> = self.get_json("/active-items").await?;
        Ok(wire
            .into_iter()
            .filter_map(|w| match w.into_item() {
                Ok(item) => Some(item),
                Err(e) => {
                    debug!(error = %e, "skipping malformed active item");
                    None
                }
            })
            .collect())
    }

    async fn place_bid(
        &self,
        item_id: ItemId,
        amount: Decimal,
        request_token: &str,
    ) -> Result<AuctionItem, BidError> {
        if self.credentials.credential().is_none() {
            return Err(BidError::Unauthenticated);
        }

        let response = self
            .request(Method::POST, &format!("/user_bid/{item_id}"))
            .header("Idempotency-Key", request_token)
            .json(&serde_json::json!({ "user_bid": amount }))
            .send()
            .await
            .map_err(|e| {
                self.set_source(DataSource::Degraded);
                BidError::Fetch(FetchError::Http(e))
            })?;
        self.set_source(DataSource::Live);

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            let parsed: Option<WireBidResponse> = serde_json::from_str(&body).ok();
            if let Some(WireBidResponse { item: Some(wire) }) = parsed {
                return Ok(wire.into_item()?);
            }
            // Accepted but no item echoed back; fetch the authoritative state.
            return Ok(self.fetch_item(item_id).await?);
        }

        match parse_error_detail(&body) {
            Some(detail) if detail.kind.as_deref() == Some("LessBidError") => Err(BidError::Outbid {
                current_bid: detail.current_bid,
            }),
            Some(detail) => Err(BidError::Server(
                detail.message.unwrap_or_else(|| "bid rejected".to_string()),
            )),
            None => Err(BidError::Fetch(status_error(status, &body))),
        }
    }

    fn source(&self) -> DataSource {
        if self.degraded.load(Ordering::SeqCst) {
            DataSource::Degraded
        } else {
            DataSource::Live
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_error_detail() {
        let detail = parse_error_detail(
            r#"{"detail": {"message": "Your bid is too low", "type": "LessBidError", "current_bid": 500}}"#,
        )
        .unwrap();
        assert_eq!(detail.kind.as_deref(), Some("LessBidError"));
        assert_eq!(detail.current_bid, Some(dec!(500)));

        assert!(parse_error_detail("not json").is_none());
        assert!(parse_error_detail(r#"{"detail": null}"#).is_none());
    }

    #[test]
    fn test_bid_response_item_key() {
        let body = r#"{
            "message": "You have placed bid for ",
            "item details": {
                "item_id": 2,
                "name": "Vintage Watch",
                "start_price": 300,
                "current_bid": 900,
                "start_time": "2025-04-29T09:00:00",
                "end_time": "2025-04-30T20:00:00",
                "status": true,
                "won_by": 4
            }
        }"#;
        let parsed: WireBidResponse = serde_json::from_str(body).unwrap();
        let item = parsed.item.unwrap().into_item().unwrap();
        assert_eq!(item.current_bid, Some(dec!(900)));
        assert_eq!(item.winner_id, Some(4));
    }
}
