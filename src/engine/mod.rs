mod submit;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::AuctionApi;
use crate::auth::CredentialProvider;
use crate::channel::{ChannelEvent, ChannelKey, ChannelManager, ChannelStatus, InboundMessage};
use crate::error::{BidError, FetchError};
use crate::events::AuctionEvent;
use crate::state::{AuctionItem, AuctionState, Bid, ItemId, DEFAULT_HISTORY_LIMIT};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// REST refresh cadence while the live channel is down.
    pub poll_interval: Duration,
    /// First initial-load retry delay; doubles per consecutive failure.
    pub load_retry_delay: Duration,
    /// Cap for the load retry backoff.
    pub load_retry_max_delay: Duration,
    /// Failures before `LoadFailed` events start.
    pub load_failures_before_warn: u32,
    pub bid_history_limit: usize,
    /// How long a channel submission waits for its echo before falling back
    /// to REST.
    pub echo_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            load_retry_delay: Duration::from_secs(3),
            load_retry_max_delay: Duration::from_secs(30),
            load_failures_before_warn: 3,
            bid_history_limit: DEFAULT_HISTORY_LIMIT,
            echo_timeout: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    fn load_delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.load_retry_delay
            .saturating_mul(1u32 << exp)
            .min(self.load_retry_max_delay)
    }
}

/// Drives auction lifecycles: hands out one [`AuctionWatch`] per item, each
/// backed by a task that loads the item, rides the live channel while the
/// auction runs and settles the final state at the end.
pub struct AuctionEngine {
    api: Arc<dyn AuctionApi>,
    channels: ChannelManager,
    credentials: Arc<dyn CredentialProvider>,
    cfg: EngineConfig,
}

impl AuctionEngine {
    pub fn new(
        api: Arc<dyn AuctionApi>,
        channels: ChannelManager,
        credentials: Arc<dyn CredentialProvider>,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            api,
            channels,
            credentials,
            cfg,
        }
    }

    /// Start watching an item. The returned watch owns the driving task and
    /// tears everything down on drop.
    pub fn watch(&self, item_id: ItemId) -> AuctionWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(WatchContext {
            item_id,
            api: self.api.clone(),
            channels: self.channels.clone(),
            credentials: self.credentials.clone(),
            cfg: self.cfg.clone(),
            shared: Mutex::new(WatchShared { state: None }),
            events: tx,
        });
        let task = tokio::spawn(run_watch(ctx.clone()));
        AuctionWatch {
            ctx,
            events: rx,
            task,
        }
    }

    pub async fn active_items(&self) -> Result<Vec<AuctionItem>, FetchError> {
        self.api.active_items().await
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }
}

struct WatchShared {
    state: Option<AuctionState>,
}

pub(crate) struct WatchContext {
    item_id: ItemId,
    api: Arc<dyn AuctionApi>,
    channels: ChannelManager,
    credentials: Arc<dyn CredentialProvider>,
    cfg: EngineConfig,
    shared: Mutex<WatchShared>,
    events: mpsc::UnboundedSender<AuctionEvent>,
}

/// One watched auction. `state()` snapshots the authoritative state at any
/// time; `recv()` streams the change events the background task emits.
pub struct AuctionWatch {
    ctx: Arc<WatchContext>,
    events: mpsc::UnboundedReceiver<AuctionEvent>,
    task: JoinHandle<()>,
}

impl AuctionWatch {
    pub fn item_id(&self) -> ItemId {
        self.ctx.item_id
    }

    /// Current state, `None` until the initial load finished.
    pub fn state(&self) -> Option<AuctionState> {
        self.ctx.shared.lock().unwrap().state.clone()
    }

    /// Next change event. `None` once the watch shut down and drained.
    pub async fn recv(&mut self) -> Option<AuctionEvent> {
        self.events.recv().await
    }

    /// Submit a bid for the watched item, preferring the live channel and
    /// falling back to REST. On success returns the authoritative highest
    /// amount; see [`BidError`] for the refusal cases.
    pub async fn submit_bid(&self, amount: Decimal) -> Result<Decimal, BidError> {
        submit::submit(&self.ctx, amount).await
    }
}

impl Drop for AuctionWatch {
    fn drop(&mut self) {
        self.task.abort();
        self.ctx.channels.close_item_channel(self.ctx.item_id);
    }
}

fn emit(ctx: &WatchContext, event: AuctionEvent) {
    // receiver gone means the consumer stopped caring
    let _ = ctx.events.send(event);
}

/// Compare the client's reachability flag against the state and surface
/// flips.
fn sync_source(ctx: &WatchContext) {
    let source = ctx.api.source();
    let changed = {
        let mut shared = ctx.shared.lock().unwrap();
        match shared.state.as_mut() {
            Some(state) if state.source != source => {
                state.source = source;
                true
            }
            _ => false,
        }
    };
    if changed {
        emit(ctx, AuctionEvent::SourceChanged(source));
    }
}

fn until(when: DateTime<Utc>) -> Duration {
    (when - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

async fn run_watch(ctx: Arc<WatchContext>) {
    load(&ctx).await;
    emit(&ctx, AuctionEvent::Loaded);

    loop {
        let phase = {
            let shared = ctx.shared.lock().unwrap();
            shared.state.as_ref().map(|s| s.phase)
        };
        let Some(phase) = phase else { return };

        if phase.is_ended() {
            finish_ended(&ctx).await;
            return;
        }
        if phase.is_active() {
            run_active(&ctx).await;
            continue;
        }

        // Upcoming: nothing to do until the start gun.
        let start = {
            let shared = ctx.shared.lock().unwrap();
            shared.state.as_ref().map(|s| s.item.start_time)
        };
        let Some(start) = start else { return };
        debug!(item_id = ctx.item_id, "auction upcoming, waiting for start");
        tokio::time::sleep(until(start)).await;
        let changed = {
            let mut shared = ctx.shared.lock().unwrap();
            shared
                .state
                .as_mut()
                .and_then(|s| s.recompute_phase(Utc::now()))
        };
        if let Some(phase) = changed {
            info!(item_id = ctx.item_id, ?phase, "auction started");
            emit(&ctx, AuctionEvent::PhaseChanged(phase));
        }
    }
}

/// Initial load over REST, retried until it succeeds. The watch never gives
/// up on its own; the consumer sees `LoadFailed` and decides.
async fn load(ctx: &WatchContext) {
    let mut attempts = 0u32;
    loop {
        let loaded = async {
            let item = ctx.api.fetch_item(ctx.item_id).await?;
            let bids = ctx.api.fetch_bids(ctx.item_id).await?;
            Ok::<_, FetchError>((item, bids))
        }
        .await;

        match loaded {
            Ok((item, bids)) => {
                let mut state =
                    AuctionState::new(item, bids, Utc::now(), ctx.cfg.bid_history_limit);
                state.source = ctx.api.source();
                ctx.shared.lock().unwrap().state = Some(state);
                return;
            }
            Err(e) => {
                attempts += 1;
                warn!(item_id = ctx.item_id, attempts, error = %e, "initial load failed");
                if attempts >= ctx.cfg.load_failures_before_warn {
                    emit(ctx, AuctionEvent::LoadFailed { attempts });
                }
                tokio::time::sleep(ctx.cfg.load_delay_for(attempts)).await;
            }
        }
    }
}

/// The live stretch: channel messages are the primary feed, the end timer is
/// authoritative for the phase, and REST polling covers channel outages.
/// Returns once the phase turned Ended (by clock or server signal).
async fn run_active(ctx: &WatchContext) {
    let key = ChannelKey::Item(ctx.item_id);

    // Subscribe before dialing so the first Status(Open) is not missed.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = ctx.channels.subscribe(key, move |ev| {
        let _ = tx.send(ev);
    });
    ctx.channels.open_item_channel(ctx.item_id);

    let mut poll = tokio::time::interval(ctx.cfg.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    poll.tick().await; // the immediate first tick

    let mut channel_alive = true;
    loop {
        let end_time = {
            let shared = ctx.shared.lock().unwrap();
            match shared.state.as_ref() {
                Some(state) => state.item.end_time,
                None => return,
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(until(end_time)) => {
                let changed = {
                    let mut shared = ctx.shared.lock().unwrap();
                    shared.state.as_mut().and_then(|s| s.recompute_phase(Utc::now()))
                };
                // end_time may have moved under a refresh; only a real
                // transition exits
                if changed.is_some() {
                    return;
                }
            }
            ev = rx.recv(), if channel_alive => {
                match ev {
                    Some(ev) => {
                        if handle_channel_event(ctx, ev) {
                            return;
                        }
                    }
                    None => channel_alive = false,
                }
            }
            _ = poll.tick() => {
                if ctx.channels.status(key) != ChannelStatus::Open {
                    refresh_from_rest(ctx).await;
                }
            }
        }
    }
}

/// Returns true when the event ended the auction.
fn handle_channel_event(ctx: &WatchContext, ev: ChannelEvent) -> bool {
    match ev {
        ChannelEvent::Message(InboundMessage::BidAccepted {
            item_id,
            amount,
            user_id,
        }) if item_id == ctx.item_id => {
            let applied = {
                let mut shared = ctx.shared.lock().unwrap();
                shared.state.as_mut().is_some_and(|s| {
                    s.apply_bid(Bid {
                        item_id,
                        user_id: Some(user_id),
                        bidder: None,
                        amount,
                        placed_at: Utc::now(),
                    })
                })
            };
            if applied {
                emit(
                    ctx,
                    AuctionEvent::BidUpdated {
                        amount,
                        user_id: Some(user_id),
                    },
                );
            }
            false
        }
        ChannelEvent::Message(InboundMessage::AuctionClosed { item_id })
            if item_id.is_none() || item_id == Some(ctx.item_id) =>
        {
            info!(item_id = ctx.item_id, "server closed the auction early");
            let mut shared = ctx.shared.lock().unwrap();
            if let Some(state) = shared.state.as_mut() {
                state.force_ended();
            }
            true
        }
        // Rejections belong to the submission that triggered them.
        ChannelEvent::Message(_) => false,
        ChannelEvent::Status(status) => {
            {
                let mut shared = ctx.shared.lock().unwrap();
                if let Some(state) = shared.state.as_mut() {
                    state.channel = status;
                }
            }
            emit(ctx, AuctionEvent::ChannelStatus(status));
            false
        }
        ChannelEvent::Malformed => {
            let total = {
                let mut shared = ctx.shared.lock().unwrap();
                shared.state.as_mut().map(|s| s.record_dropped())
            };
            if let Some(total) = total {
                emit(ctx, AuctionEvent::MessageDropped { total });
            }
            false
        }
    }
}

async fn refresh_from_rest(ctx: &WatchContext) {
    match ctx.api.fetch_item(ctx.item_id).await {
        Ok(fresh) => {
            let advanced = {
                let mut shared = ctx.shared.lock().unwrap();
                shared.state.as_mut().and_then(|s| {
                    if s.refresh_item(fresh) {
                        s.item.current_bid.map(|amount| (amount, s.item.winner_id))
                    } else {
                        None
                    }
                })
            };
            if let Some((amount, user_id)) = advanced {
                emit(ctx, AuctionEvent::BidUpdated { amount, user_id });
            }
        }
        Err(e) => debug!(item_id = ctx.item_id, error = %e, "poll refresh failed"),
    }
    sync_source(ctx);
}

/// Terminal step: shut the channel, fill in a missing winner over REST and
/// emit the final phase exactly once.
async fn finish_ended(ctx: &WatchContext) {
    ctx.channels.close_item_channel(ctx.item_id);
    {
        let mut shared = ctx.shared.lock().unwrap();
        if let Some(state) = shared.state.as_mut() {
            state.channel = ChannelStatus::Closed;
        }
    }

    let needs_winner = {
        let shared = ctx.shared.lock().unwrap();
        shared
            .state
            .as_ref()
            .is_some_and(|s| s.item.current_bid.is_some() && s.item.winner_id.is_none())
    };
    if needs_winner {
        if let Ok(fresh) = ctx.api.fetch_item(ctx.item_id).await {
            let mut shared = ctx.shared.lock().unwrap();
            if let Some(state) = shared.state.as_mut() {
                state.refresh_item(fresh);
            }
        }
        sync_source(ctx);
    }

    let phase = {
        let mut shared = ctx.shared.lock().unwrap();
        shared.state.as_mut().map(|s| s.force_ended())
    };
    if let Some(phase) = phase {
        info!(item_id = ctx.item_id, ?phase, "auction ended");
        emit(ctx, AuctionEvent::PhaseChanged(phase));
    }
}
