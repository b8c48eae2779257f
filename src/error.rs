use rust_decimal::Decimal;
use thiserror::Error;

/// Channel-level failures. These never reach consumers as errors - the
/// channel manager absorbs them and degrades to `Reconnecting`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
}

/// REST failures. Recoverable: the engine retries with backoff and flips
/// the data source to degraded instead of crashing.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned status {status}")]
    Status { status: u16, message: Option<String> },

    #[error("malformed response: {0}")]
    Decode(String),
}

/// Everything that can go wrong when placing a bid.
///
/// The first three variants are local validation failures and are produced
/// before any network call. `Outbid` and `Server` are authoritative
/// rejections; local state has already been reconciled when they surface.
#[derive(Debug, Error)]
pub enum BidError {
    #[error("auction is not active")]
    AuctionNotActive,

    #[error("bid must be greater than {minimum}")]
    BidTooLow { minimum: Decimal },

    #[error("no credential available")]
    Unauthenticated,

    #[error("outbid: current bid is {current_bid:?}")]
    Outbid { current_bid: Option<Decimal> },

    #[error("bid rejected: {0}")]
    Server(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}
