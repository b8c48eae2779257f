use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::debug;

use crate::error::TransportError;

/// Both halves of an established channel, decoupled from the socket so the
/// manager never touches the websocket types directly.
pub struct TransportLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Dials one channel. The manager drives everything else (reconnects,
/// dispatch, teardown), so implementations only hand over a live link.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<TransportLink, TransportError>;
}

/// Production transport over a websocket.
pub struct WsTransport;

#[async_trait]
impl ChannelTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<TransportLink, TransportError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(32);
        let (in_tx, in_rx) = mpsc::channel::<String>(64);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if write.send(tungstenite::Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(tungstenite::Message::Text(text)) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(tungstenite::Message::Close(_)) => {
                        debug!("websocket closed by server");
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "websocket read error");
                        break;
                    }
                    _ => {}
                }
            }
            // dropping in_tx signals the disconnect to the manager
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// One side of a fake connection, held by the test.
    pub struct FakePeer {
        /// Inject inbound frames toward the client.
        pub to_client: mpsc::Sender<String>,
        /// Observe frames the client sent.
        pub from_client: mpsc::Receiver<String>,
    }

    /// Scripted transport: fails the first `fail_dials` connection attempts,
    /// then hands out in-memory links whose peer ends land in `peers`.
    pub struct FakeTransport {
        pub fail_dials: AtomicUsize,
        pub dials: AtomicUsize,
        pub peers: Mutex<Vec<FakePeer>>,
        dial_delay: std::time::Duration,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self {
                fail_dials: AtomicUsize::new(0),
                dials: AtomicUsize::new(0),
                peers: Mutex::new(Vec::new()),
                dial_delay: std::time::Duration::ZERO,
            }
        }

        pub fn failing(dials: usize) -> Self {
            let t = Self::new();
            t.fail_dials.store(dials, Ordering::SeqCst);
            t
        }

        /// Each dial takes `delay` before the link comes up.
        pub fn slow(delay: std::time::Duration) -> Self {
            let mut t = Self::new();
            t.dial_delay = delay;
            t
        }

        pub fn dial_count(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        pub fn take_peer(&self) -> Option<FakePeer> {
            let mut peers = self.peers.lock().unwrap();
            if peers.is_empty() {
                None
            } else {
                Some(peers.remove(0))
            }
        }
    }

    #[async_trait]
    impl ChannelTransport for FakeTransport {
        async fn connect(&self, _url: &str) -> Result<TransportLink, TransportError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if !self.dial_delay.is_zero() {
                tokio::time::sleep(self.dial_delay).await;
            }
            if self
                .fail_dials
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Connect("connection refused".to_string()));
            }
            let (out_tx, out_rx) = mpsc::channel(8);
            let (in_tx, in_rx) = mpsc::channel(8);
            self.peers.lock().unwrap().push(FakePeer {
                to_client: in_tx,
                from_client: out_rx,
            });
            Ok(TransportLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }
}
