use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::channel::{ChannelEvent, ChannelKey, ChannelStatus, InboundMessage};
use crate::error::BidError;
use crate::events::AuctionEvent;
use crate::state::AuctionPhase;

use super::{emit, sync_source, WatchContext};

enum EchoOutcome {
    Accepted,
    Rejected {
        message: String,
        kind: Option<String>,
        current_bid: Option<Decimal>,
    },
}

/// Submit a bid: validate locally, try the live channel, fall back to REST.
/// Returns the authoritative highest amount after acceptance.
///
/// Validation failures never touch the network. At most one transport
/// carries the bid to completion: the REST fallback only runs when the
/// channel attempt produced neither an echo nor a rejection, and it reuses
/// one request token so the server can deduplicate a send that silently
/// landed.
pub(super) async fn submit(ctx: &WatchContext, amount: Decimal) -> Result<Decimal, BidError> {
    {
        let shared = ctx.shared.lock().unwrap();
        let Some(state) = shared.state.as_ref() else {
            return Err(BidError::AuctionNotActive);
        };
        if !AuctionPhase::derive(&state.item, Utc::now()).is_active() {
            return Err(BidError::AuctionNotActive);
        }
        let minimum = state.minimum_next_bid();
        if amount <= minimum {
            return Err(BidError::BidTooLow { minimum });
        }
    }
    if ctx.credentials.credential().is_none() {
        return Err(BidError::Unauthenticated);
    }

    let request_token = Uuid::new_v4().to_string();
    let key = ChannelKey::Item(ctx.item_id);

    if ctx.channels.status(key) == ChannelStatus::Open {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = ctx.channels.subscribe(key, move |ev| {
            if let ChannelEvent::Message(msg) = ev {
                let _ = tx.send(msg);
            }
        });

        if ctx.channels.send_bid(ctx.item_id, amount) {
            let outcome =
                tokio::time::timeout(ctx.cfg.echo_timeout, wait_for_echo(rx, amount)).await;
            sub.unsubscribe();
            match outcome {
                Ok(EchoOutcome::Accepted) => {
                    // the watch's own subscription merges the broadcast
                    info!(item_id = ctx.item_id, %amount, "bid accepted over channel");
                    return Ok(amount);
                }
                Ok(EchoOutcome::Rejected {
                    message,
                    kind,
                    current_bid,
                }) => {
                    return Err(reconcile_rejection(ctx, message, kind, current_bid).await);
                }
                Err(_) => {
                    debug!(
                        item_id = ctx.item_id,
                        "no bid echo within timeout, falling back to rest"
                    );
                }
            }
        } else {
            sub.unsubscribe();
        }
    }

    match ctx.api.place_bid(ctx.item_id, amount, &request_token).await {
        Ok(item) => {
            let mut authoritative = amount;
            let advanced = {
                let mut shared = ctx.shared.lock().unwrap();
                shared.state.as_mut().and_then(|s| {
                    let merged = s.refresh_item(item);
                    if let Some(a) = s.item.current_bid {
                        authoritative = a;
                    }
                    if merged {
                        s.item.current_bid.map(|a| (a, s.item.winner_id))
                    } else {
                        None
                    }
                })
            };
            if let Some((amount, user_id)) = advanced {
                emit(ctx, AuctionEvent::BidUpdated { amount, user_id });
            }
            sync_source(ctx);
            info!(item_id = ctx.item_id, %amount, "bid accepted over rest");
            Ok(authoritative)
        }
        Err(BidError::Outbid { current_bid }) => {
            Err(reconcile_rejection(
                ctx,
                "bid too low".to_string(),
                Some("LessBidError".to_string()),
                current_bid,
            )
            .await)
        }
        Err(e) => {
            sync_source(ctx);
            Err(e)
        }
    }
}

/// Wait for this submission's broadcast among the channel traffic. Accepted
/// bids are matched by amount; other users' bids pass through untouched.
async fn wait_for_echo(
    mut rx: mpsc::UnboundedReceiver<InboundMessage>,
    amount: Decimal,
) -> EchoOutcome {
    loop {
        match rx.recv().await {
            Some(InboundMessage::BidAccepted { amount: echoed, .. }) if echoed == amount => {
                return EchoOutcome::Accepted;
            }
            Some(InboundMessage::BidRejected {
                message,
                kind,
                current_bid,
            }) => {
                return EchoOutcome::Rejected {
                    message,
                    kind,
                    current_bid,
                };
            }
            Some(_) => {}
            // channel torn down mid-wait; let the timeout decide
            None => std::future::pending::<()>().await,
        }
    }
}

/// A refusal means the server knows something we do not; pull the current
/// amount into the state (from the rejection payload, or one fetch) before
/// reporting, so the caller's next attempt validates against reality.
async fn reconcile_rejection(
    ctx: &WatchContext,
    message: String,
    kind: Option<String>,
    current_bid: Option<Decimal>,
) -> BidError {
    let observed = match current_bid {
        Some(amount) => Some(amount),
        None => match ctx.api.fetch_item(ctx.item_id).await {
            Ok(item) => item.current_bid,
            Err(e) => {
                debug!(item_id = ctx.item_id, error = %e, "reconcile fetch failed");
                None
            }
        },
    };

    if let Some(amount) = observed {
        let advanced = {
            let mut shared = ctx.shared.lock().unwrap();
            shared
                .state
                .as_mut()
                .is_some_and(|s| s.observe_bid_amount(amount))
        };
        if advanced {
            emit(
                ctx,
                AuctionEvent::BidUpdated {
                    amount,
                    user_id: None,
                },
            );
        }
    }

    if kind.as_deref() == Some("LessBidError") {
        BidError::Outbid {
            current_bid: observed,
        }
    } else {
        BidError::Server(message)
    }
}
