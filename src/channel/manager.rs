use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::CredentialProvider;
use crate::state::ItemId;

use super::transport::{ChannelTransport, TransportLink};
use super::{parse_inbound, ChannelEvent, ChannelKey, ChannelStatus};

type Listener = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// First reconnect delay; doubles per consecutive failure.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ChannelConfig {
    fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

struct ChannelHandle {
    status: ChannelStatus,
    outbound: Option<tokio::sync::mpsc::Sender<String>>,
    listeners: Vec<(u64, Listener)>,
    /// Consecutive failed dials; reset on a successful open.
    retries: u32,
    dropped: u64,
    /// Bumped on every (re)open so tasks from a superseded connection
    /// cannot touch the handle.
    epoch: u64,
    reader: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    fn new() -> Self {
        Self {
            status: ChannelStatus::Closed,
            outbound: None,
            listeners: Vec::new(),
            retries: 0,
            dropped: 0,
            epoch: 0,
            reader: None,
            reconnect: None,
        }
    }

    fn snapshot_listeners(&self) -> Vec<Listener> {
        self.listeners.iter().map(|(_, l)| l.clone()).collect()
    }
}

struct Registry {
    channels: BTreeMap<ChannelKey, ChannelHandle>,
    online: bool,
    next_epoch: u64,
    next_subscription: u64,
}

/// Multiplexes the per-item live channels plus the global active-items
/// broadcast, hiding reconnection from consumers.
///
/// The key-to-handle map is the only process-wide mutable state; every
/// mutation happens in short critical sections and listener dispatch always
/// runs outside the lock, so listeners may call back into the manager.
/// Transport faults never propagate as errors - they become status
/// transitions.
#[derive(Clone)]
pub struct ChannelManager {
    registry: Arc<Mutex<Registry>>,
    transport: Arc<dyn ChannelTransport>,
    credentials: Arc<dyn CredentialProvider>,
    ws_base: String,
    cfg: ChannelConfig,
}

impl ChannelManager {
    pub fn new(
        ws_base: impl Into<String>,
        transport: Arc<dyn ChannelTransport>,
        credentials: Arc<dyn CredentialProvider>,
        cfg: ChannelConfig,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                channels: BTreeMap::new(),
                online: true,
                next_epoch: 0,
                next_subscription: 0,
            })),
            transport,
            credentials,
            ws_base: ws_base.into(),
            cfg,
        }
    }

    /// Open the live channel for an item. Idempotent: an existing `Open` or
    /// `Connecting` channel is left alone. Missing credentials never fail
    /// the call - the channel parks in `Reconnecting` and picks the token up
    /// on a later attempt.
    pub fn open_item_channel(&self, item_id: ItemId) -> ChannelStatus {
        self.open(ChannelKey::Item(item_id))
    }

    /// Open the global broadcast of active items.
    pub fn open_active_items_channel(&self) -> ChannelStatus {
        self.open(ChannelKey::ActiveItems)
    }

    fn open(&self, key: ChannelKey) -> ChannelStatus {
        let (status, epoch, dial) = {
            let mut reg = self.registry.lock().unwrap();
            if let Some(handle) = reg.channels.get(&key) {
                if matches!(handle.status, ChannelStatus::Open | ChannelStatus::Connecting) {
                    return handle.status;
                }
            }
            reg.next_epoch += 1;
            let epoch = reg.next_epoch;
            let online = reg.online;
            let status = if online {
                ChannelStatus::Connecting
            } else {
                ChannelStatus::Reconnecting
            };
            let handle = reg.channels.entry(key).or_insert_with(ChannelHandle::new);
            if let Some(task) = handle.reconnect.take() {
                task.abort();
            }
            if let Some(task) = handle.reader.take() {
                task.abort();
            }
            handle.status = status;
            handle.retries = 0;
            handle.outbound = None;
            handle.epoch = epoch;
            (status, epoch, online)
        };
        debug!(?key, ?status, "opening channel");
        if dial {
            self.spawn_dial(key, epoch);
        }
        status
    }

    /// Close a channel for good: aborts the reader and any pending reconnect
    /// timer and removes the handle. Idempotent on unknown ids; never
    /// followed by a reconnect.
    pub fn close_item_channel(&self, item_id: ItemId) {
        self.close(ChannelKey::Item(item_id));
    }

    fn close(&self, key: ChannelKey) {
        let removed = self.registry.lock().unwrap().channels.remove(&key);
        let Some(mut handle) = removed else { return };
        if let Some(task) = handle.reader.take() {
            task.abort();
        }
        if let Some(task) = handle.reconnect.take() {
            task.abort();
        }
        debug!(?key, "channel closed");
        dispatch(
            &handle.snapshot_listeners(),
            ChannelEvent::Status(ChannelStatus::Closed),
        );
    }

    pub fn close_all(&self) {
        let keys: Vec<ChannelKey> = {
            let reg = self.registry.lock().unwrap();
            reg.channels.keys().copied().collect()
        };
        for key in keys {
            self.close(key);
        }
    }

    /// Hand a bid to the transport. Returns whether it was handed over, not
    /// whether the server accepted it; nothing is queued for a closed
    /// channel - the caller falls back to REST.
    pub fn send_bid(&self, item_id: ItemId, amount: Decimal) -> bool {
        let payload = serde_json::json!({ "amount": amount }).to_string();
        self.send_raw(ChannelKey::Item(item_id), payload)
    }

    fn send_raw(&self, key: ChannelKey, payload: String) -> bool {
        let outbound = {
            let reg = self.registry.lock().unwrap();
            match reg.channels.get(&key) {
                Some(handle) if handle.status == ChannelStatus::Open => handle.outbound.clone(),
                _ => None,
            }
        };
        match outbound {
            Some(tx) => tx.try_send(payload).is_ok(),
            None => false,
        }
    }

    /// Register a listener for a channel's events, invoked once per event in
    /// arrival order on the channel's single dispatch path. The subscription
    /// unregisters on drop and is a no-op after channel teardown.
    pub fn subscribe<F>(&self, key: ChannelKey, listener: F) -> Subscription
    where
        F: Fn(ChannelEvent) + Send + Sync + 'static,
    {
        let mut reg = self.registry.lock().unwrap();
        reg.next_subscription += 1;
        let id = reg.next_subscription;
        let handle = reg.channels.entry(key).or_insert_with(ChannelHandle::new);
        handle.listeners.push((id, Arc::new(listener)));
        Subscription {
            registry: self.registry.clone(),
            key,
            id,
        }
    }

    pub fn status(&self, key: ChannelKey) -> ChannelStatus {
        let reg = self.registry.lock().unwrap();
        reg.channels
            .get(&key)
            .map(|h| h.status)
            .unwrap_or(ChannelStatus::Closed)
    }

    pub fn retry_count(&self, key: ChannelKey) -> u32 {
        let reg = self.registry.lock().unwrap();
        reg.channels.get(&key).map(|h| h.retries).unwrap_or(0)
    }

    pub fn dropped_messages(&self, key: ChannelKey) -> u64 {
        let reg = self.registry.lock().unwrap();
        reg.channels.get(&key).map(|h| h.dropped).unwrap_or(0)
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.registry.lock().unwrap().channels.len()
    }

    /// React to the network going away or coming back. Offline closes every
    /// transport (a disconnect, not an error); online re-dials everything
    /// that was previously open or reconnecting.
    pub fn set_online(&self, online: bool) {
        if online {
            info!("network online, resuming channels");
            let keys: Vec<ChannelKey> = {
                let mut reg = self.registry.lock().unwrap();
                reg.online = true;
                reg.channels
                    .iter()
                    .filter(|(_, h)| h.status == ChannelStatus::Reconnecting)
                    .map(|(k, _)| *k)
                    .collect()
            };
            for key in keys {
                let epoch = {
                    let mut reg = self.registry.lock().unwrap();
                    reg.next_epoch += 1;
                    let epoch = reg.next_epoch;
                    let Some(handle) = reg.channels.get_mut(&key) else { continue };
                    if let Some(task) = handle.reconnect.take() {
                        task.abort();
                    }
                    handle.status = ChannelStatus::Connecting;
                    handle.epoch = epoch;
                    epoch
                };
                self.spawn_dial(key, epoch);
            }
        } else {
            warn!("network offline, suspending channels");
            let affected: Vec<Vec<Listener>> = {
                let mut reg = self.registry.lock().unwrap();
                reg.online = false;
                let keys: Vec<ChannelKey> = reg.channels.keys().copied().collect();
                let mut out = Vec::new();
                for key in keys {
                    // new epoch so an in-flight dial cannot mark the handle
                    // Open after we suspend it
                    reg.next_epoch += 1;
                    let epoch = reg.next_epoch;
                    let Some(handle) = reg.channels.get_mut(&key) else { continue };
                    if handle.status == ChannelStatus::Closed {
                        continue;
                    }
                    handle.epoch = epoch;
                    if let Some(task) = handle.reader.take() {
                        task.abort();
                    }
                    if let Some(task) = handle.reconnect.take() {
                        task.abort();
                    }
                    handle.outbound = None;
                    if handle.status != ChannelStatus::Reconnecting {
                        handle.status = ChannelStatus::Reconnecting;
                        out.push(handle.snapshot_listeners());
                    }
                }
                out
            };
            for listeners in affected {
                dispatch(&listeners, ChannelEvent::Status(ChannelStatus::Reconnecting));
            }
        }
    }

    fn url_for(&self, key: ChannelKey, token: Option<&str>) -> String {
        let mut url = format!("{}{}", self.ws_base, key.path());
        if let Some(token) = token {
            url.push_str("?token=");
            url.push_str(token);
        }
        url
    }

    fn spawn_dial(&self, key: ChannelKey, epoch: u64) {
        let mgr = self.clone();
        let task = tokio::spawn(async move {
            mgr.connect(key, epoch).await;
        });
        let mut reg = self.registry.lock().unwrap();
        match reg.channels.get_mut(&key) {
            Some(handle) if handle.epoch == epoch => {
                if let Some(old) = handle.reader.replace(task) {
                    old.abort();
                }
            }
            _ => task.abort(),
        }
    }

    async fn connect(&self, key: ChannelKey, epoch: u64) {
        // Item channels need a credential; the broadcast channel does not.
        let token = self.credentials.credential();
        if token.is_none() && matches!(key, ChannelKey::Item(_)) {
            debug!(?key, "no credential available, parking channel");
            self.mark_reconnecting(key, epoch, false);
            self.schedule_reconnect(key, epoch);
            return;
        }

        let url = self.url_for(key, token.as_deref());
        match self.transport.connect(&url).await {
            Ok(link) => self.run_open(key, epoch, link).await,
            Err(e) => {
                warn!(?key, error = %e, "channel dial failed");
                self.mark_reconnecting(key, epoch, true);
                self.schedule_reconnect(key, epoch);
            }
        }
    }

    async fn run_open(&self, key: ChannelKey, epoch: u64, mut link: TransportLink) {
        let listeners = {
            let mut reg = self.registry.lock().unwrap();
            let Some(handle) = reg.channels.get_mut(&key) else { return };
            if handle.epoch != epoch {
                return;
            }
            handle.status = ChannelStatus::Open;
            handle.retries = 0;
            handle.outbound = Some(link.outbound.clone());
            handle.snapshot_listeners()
        };
        info!(?key, "channel open");
        dispatch(&listeners, ChannelEvent::Status(ChannelStatus::Open));

        while let Some(text) = link.inbound.recv().await {
            let parsed = parse_inbound(&text);
            let listeners = {
                let mut reg = self.registry.lock().unwrap();
                let Some(handle) = reg.channels.get_mut(&key) else { return };
                if handle.epoch != epoch {
                    return;
                }
                if parsed.is_none() {
                    handle.dropped += 1;
                }
                handle.snapshot_listeners()
            };
            match parsed {
                Some(msg) => dispatch(&listeners, ChannelEvent::Message(msg)),
                None => {
                    debug!(?key, "dropping malformed channel message");
                    dispatch(&listeners, ChannelEvent::Malformed);
                }
            }
        }

        // The transport went away underneath us.
        warn!(?key, "channel disconnected");
        self.mark_reconnecting(key, epoch, true);
        self.schedule_reconnect(key, epoch);
    }

    fn mark_reconnecting(&self, key: ChannelKey, epoch: u64, count_failure: bool) {
        let listeners = {
            let mut reg = self.registry.lock().unwrap();
            let Some(handle) = reg.channels.get_mut(&key) else { return };
            if handle.epoch != epoch {
                return;
            }
            handle.outbound = None;
            if count_failure {
                handle.retries += 1;
            }
            if handle.status == ChannelStatus::Reconnecting {
                return;
            }
            handle.status = ChannelStatus::Reconnecting;
            handle.snapshot_listeners()
        };
        dispatch(&listeners, ChannelEvent::Status(ChannelStatus::Reconnecting));
    }

    /// At most one pending reconnect timer per key; scheduling replaces any
    /// prior timer.
    fn schedule_reconnect(&self, key: ChannelKey, epoch: u64) {
        let delay = {
            let reg = self.registry.lock().unwrap();
            let Some(handle) = reg.channels.get(&key) else { return };
            if handle.epoch != epoch {
                return;
            }
            if !reg.online {
                // set_online(true) re-dials everything; no timer while offline
                return;
            }
            self.cfg.delay_for(handle.retries)
        };

        let mgr = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let proceed = {
                let mut reg = mgr.registry.lock().unwrap();
                let online = reg.online;
                match reg.channels.get_mut(&key) {
                    Some(handle)
                        if handle.epoch == epoch
                            && handle.status == ChannelStatus::Reconnecting
                            && online =>
                    {
                        handle.status = ChannelStatus::Connecting;
                        true
                    }
                    _ => false,
                }
            };
            if proceed {
                mgr.connect(key, epoch).await;
            }
        });

        let mut reg = self.registry.lock().unwrap();
        match reg.channels.get_mut(&key) {
            Some(handle) if handle.epoch == epoch => {
                if let Some(old) = handle.reconnect.replace(task) {
                    old.abort();
                }
            }
            _ => task.abort(),
        }
    }
}

fn dispatch(listeners: &[Listener], event: ChannelEvent) {
    for listener in listeners {
        listener(event.clone());
    }
}

/// Registration handle returned by [`ChannelManager::subscribe`]. Dropping
/// it (or calling [`unsubscribe`](Subscription::unsubscribe)) removes the
/// listener; harmless after the channel is gone.
pub struct Subscription {
    registry: Arc<Mutex<Registry>>,
    key: ChannelKey,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut reg) = self.registry.lock() {
            if let Some(handle) = reg.channels.get_mut(&self.key) {
                handle.listeners.retain(|(id, _)| *id != self.id);
                // reap a placeholder that was never opened
                if handle.listeners.is_empty() && handle.status == ChannelStatus::Closed {
                    reg.channels.remove(&self.key);
                }
            }
        }
    }
}
