mod api;
mod auth;
mod channel;
mod config;
mod engine;
mod error;
mod events;
mod state;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use api::RestClient;
use auth::EnvCredentials;
use channel::{ChannelEvent, ChannelKey, ChannelManager, InboundMessage, WsTransport};
use config::Config;
use engine::AuctionEngine;
use events::AuctionEvent;
use state::AuctionPhase;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = Config::load("config.toml").context("failed to load config.toml")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.general.log_level.clone())),
        )
        .init();

    let item_id: state::ItemId = std::env::args()
        .nth(1)
        .context("usage: bidwire <item-id>")?
        .parse()
        .context("item id must be a number")?;

    let credentials = Arc::new(EnvCredentials::new("AUCTION_TOKEN"));
    let api = Arc::new(RestClient::new(
        cfg.server.base_url.clone(),
        credentials.clone(),
        cfg.request_timeout(),
    )?);
    let channels = ChannelManager::new(
        cfg.server.ws_url.clone(),
        Arc::new(WsTransport),
        credentials.clone(),
        cfg.channel_config(),
    );
    let engine = AuctionEngine::new(api, channels, credentials, cfg.engine_config());

    match engine.active_items().await {
        Ok(items) => {
            for item in &items {
                info!(item.item_id, name = %item.name, current_bid = ?item.current_bid, "active");
            }
            info!(count = items.len(), "active auctions");
        }
        Err(e) => warn!(error = %e, "could not list active auctions"),
    }

    // global broadcast keeps the console aware of the other lots
    let _active_sub = engine
        .channels()
        .subscribe(ChannelKey::ActiveItems, |ev| {
            if let ChannelEvent::Message(InboundMessage::ActiveItems(items)) = ev {
                info!(count = items.len(), "active items update");
            }
        });
    engine.channels().open_active_items_channel();

    info!(item_id, "watching auction");
    let mut watch = engine.watch(item_id);

    loop {
        tokio::select! {
            ev = watch.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    AuctionEvent::Loaded => {
                        if let Some(state) = watch.state() {
                            info!(
                                name = %state.item.name,
                                current_bid = ?state.item.current_bid,
                                phase = ?state.phase,
                                "auction loaded"
                            );
                        }
                    }
                    AuctionEvent::LoadFailed { attempts } => {
                        warn!(attempts, "still trying to load the auction");
                    }
                    AuctionEvent::BidUpdated { amount, user_id } => {
                        info!(%amount, ?user_id, "new highest bid");
                    }
                    AuctionEvent::PhaseChanged(phase) => {
                        info!(?phase, "phase changed");
                        if let AuctionPhase::Ended { winner } = phase {
                            info!(?winner, "auction over");
                            break;
                        }
                    }
                    AuctionEvent::ChannelStatus(status) => {
                        info!(?status, "live channel");
                    }
                    AuctionEvent::SourceChanged(source) => {
                        warn!(?source, "data source changed");
                    }
                    AuctionEvent::MessageDropped { total } => {
                        warn!(total, "dropped a malformed message");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    info!(item_id = watch.item_id(), "stopped watching");
    drop(watch);
    engine.channels().close_all();
    Ok(())
}
