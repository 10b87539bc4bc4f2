//! src/sync/relay_hub.rs
//!
//! WebSocket side of the relay. Keeps the newest stamped value per key and
//! forwards every accepted write to the connections subscribed to that key.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use toybox_common::traits::StampedValue;

use crate::sync::protocol::RelayFrame;
use crate::Error;

const UPDATE_BUFFER: usize = 1024;

pub struct RelayHub {
    values: RwLock<HashMap<String, StampedValue>>,
    updates: broadcast::Sender<StampedValue>,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayHub {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            values: RwLock::new(HashMap::new()),
            updates,
        }
    }

    pub fn current(&self, key: &str) -> Option<StampedValue> {
        self.values.read().get(key).cloned()
    }

    /// Stores `update` if it is newer than what we hold and fans it out.
    /// Stale writes are dropped here so they never reach other clients.
    pub fn accept_update(&self, update: StampedValue) -> bool {
        {
            let mut values = self.values.write();
            let newer = values
                .get(&update.key)
                .map_or(true, |cur| update.timestamp > cur.timestamp);
            if !newer {
                debug!("RelayHub: stale write for '{}' ts={}", update.key, update.timestamp);
                return false;
            }
            values.insert(update.key.clone(), update.clone());
        }
        // No receivers just means nobody is connected.
        let _ = self.updates.send(update);
        true
    }

    /// Accepts connections until `shutdown_rx` flips to true. Open
    /// connections are closed on shutdown as well.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        info!("RelayHub listening on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let hub = self.clone();
                        let conn_shutdown = shutdown_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = hub.handle_connection(stream, peer, conn_shutdown).await {
                                warn!("RelayHub: connection {} ended with error => {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("RelayHub: accept failed => {}", e),
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("RelayHub stopped");
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let ws = accept_async(stream).await?;
        debug!("RelayHub: {} connected", peer);
        let (mut sink, mut incoming) = ws.split();
        let mut updates = self.updates.subscribe();
        let mut keys: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                msg = incoming.next() => match msg {
                    Some(Ok(Message::Text(text))) => match RelayFrame::from_text(text.as_str()) {
                        Ok(RelayFrame::Subscribe { key }) => {
                            let frame = RelayFrame::Snapshot { update: self.current(&key), key: key.clone() };
                            sink.send(Message::text(frame.to_text()?)).await?;
                            keys.insert(key);
                        }
                        Ok(RelayFrame::Unsubscribe { key }) => {
                            keys.remove(&key);
                        }
                        Ok(RelayFrame::Publish { update }) => {
                            self.accept_update(update);
                        }
                        Ok(RelayFrame::Update { .. } | RelayFrame::Snapshot { .. }) => {
                            debug!("RelayHub: {} sent a hub-only frame, ignoring", peer);
                        }
                        Err(e) => warn!("RelayHub: unreadable frame from {} => {}", peer, e),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                update = updates.recv() => match update {
                    Ok(update) => {
                        if keys.contains(&update.key) {
                            let frame = RelayFrame::Update { update };
                            sink.send(Message::text(frame.to_text()?)).await?;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("RelayHub: {} lagged by {} update(s), resending current values", peer, skipped);
                        for key in &keys {
                            if let Some(update) = self.current(key) {
                                let frame = RelayFrame::Update { update };
                                sink.send(Message::text(frame.to_text()?)).await?;
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown_rx.changed() => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
        debug!("RelayHub: {} disconnected", peer);
        Ok(())
    }
}
