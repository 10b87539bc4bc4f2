//! src/sync/relay.rs
//!
//! Sync channel that talks to a `RelayHub` over WebSocket. The connection is
//! owned by a background task which reconnects with a fixed backoff; while it
//! is down, publishes queue up locally and go out once it is back.
//!
//! `connect` does not wait for the hub. Callers that are about to seed
//! defaults must `prime` the keys first, otherwise a fresh stamp on the
//! defaults would beat whatever the hub already holds.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use toybox_common::traits::{ChannelCallback, ChannelEvent, StampedValue, SubscriptionId, SyncChannel};

use crate::sync::protocol::RelayFrame;
use crate::Error;

pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

struct RelayInner {
    url: String,
    cache: RwLock<HashMap<String, StampedValue>>,
    subscribers: Mutex<HashMap<SubscriptionId, (String, ChannelCallback)>>,
    next_id: AtomicU64,
    outgoing: mpsc::UnboundedSender<RelayFrame>,
    connected: AtomicBool,
    /// Keys the hub has answered a `Subscribe` for.
    answered: watch::Sender<HashSet<String>>,
}

pub struct RelayChannel {
    inner: Arc<RelayInner>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayChannel {
    /// Starts connecting to `url` (e.g. `ws://127.0.0.1:9777`) in the
    /// background and returns immediately. Must be called inside a tokio
    /// runtime.
    pub fn connect(url: &str) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(RelayInner {
            url: url.to_string(),
            cache: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            outgoing,
            connected: AtomicBool::new(false),
            answered: watch::Sender::new(HashSet::new()),
        });
        let task = tokio::spawn(connection_loop(inner.clone(), outgoing_rx, shutdown_rx));
        Self {
            inner,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Subscribes to `keys` and waits until the hub has sent its snapshot of
    /// every one of them, so `get_current` reflects the hub afterwards.
    /// Returns false if that did not happen within `timeout`.
    pub async fn prime(&self, keys: &[&str], timeout: Duration) -> bool {
        let noop: ChannelCallback = Arc::new(|_| {});
        let ids: Vec<SubscriptionId> = keys.iter().map(|k| self.subscribe(k, noop.clone())).collect();

        let mut answered = self.inner.answered.subscribe();
        let ready = tokio::time::timeout(
            timeout,
            answered.wait_for(|set| keys.iter().all(|k| set.contains(*k))),
        )
        .await
        .is_ok_and(|r| r.is_ok());

        for id in ids {
            self.unsubscribe(id);
        }
        if !ready {
            warn!("RelayChannel {}: no snapshot for {:?} within {:?}", self.inner.url, keys, timeout);
        }
        ready
    }

    /// Stops reconnecting and closes the socket. Checked between attempts,
    /// so an in-flight connect finishes first.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Closes and waits for the connection task to exit.
    pub async fn shutdown(&self) {
        self.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl RelayInner {
    fn subscribed_keys(&self) -> HashSet<String> {
        self.subscribers.lock().values().map(|(k, _)| k.clone()).collect()
    }

    fn send(&self, frame: RelayFrame) {
        if self.outgoing.send(frame).is_err() {
            debug!("RelayChannel {}: connection task is gone, dropping frame", self.url);
        }
    }

    fn remember(&self, update: &StampedValue) {
        let mut cache = self.cache.write();
        let newer = cache
            .get(&update.key)
            .map_or(true, |cur| update.timestamp > cur.timestamp);
        if newer {
            cache.insert(update.key.clone(), update.clone());
        }
    }

    fn deliver(&self, event: ChannelEvent, key: Option<&str>) {
        let targets: Vec<ChannelCallback> = self
            .subscribers
            .lock()
            .values()
            .filter(|(k, _)| key.map_or(true, |want| k == want))
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in targets {
            cb(event.clone());
        }
    }

    fn handle_text(&self, text: &str) {
        match RelayFrame::from_text(text) {
            Ok(RelayFrame::Update { update }) => {
                self.remember(&update);
                let key = update.key.clone();
                self.deliver(ChannelEvent::Update(update), Some(&key));
            }
            Ok(RelayFrame::Snapshot { key, update }) => {
                if let Some(update) = update {
                    self.remember(&update);
                    self.deliver(ChannelEvent::Update(update), Some(&key));
                }
                self.answered.send_modify(|set| {
                    set.insert(key);
                });
            }
            Ok(other) => debug!("RelayChannel {}: ignoring unexpected frame {:?}", self.url, other),
            Err(e) => warn!("RelayChannel {}: unreadable frame => {}", self.url, e),
        }
    }
}

impl SyncChannel for RelayChannel {
    fn publish(&self, update: StampedValue) {
        self.inner.remember(&update);
        self.inner.send(RelayFrame::Publish { update });
    }

    fn subscribe(&self, key: &str, callback: ChannelCallback) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let first_for_key = {
            let mut subs = self.inner.subscribers.lock();
            let first = !subs.values().any(|(k, _)| k == key);
            subs.insert(id, (key.to_string(), callback));
            first
        };
        if first_for_key {
            self.inner.send(RelayFrame::Subscribe { key: key.to_string() });
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let emptied_key = {
            let mut subs = self.inner.subscribers.lock();
            match subs.remove(&id) {
                Some((key, _)) if !subs.values().any(|(k, _)| *k == key) => Some(key),
                _ => None,
            }
        };
        if let Some(key) = emptied_key {
            self.inner.send(RelayFrame::Unsubscribe { key });
        }
    }

    fn get_current(&self, key: &str) -> Option<StampedValue> {
        self.inner.cache.read().get(key).cloned()
    }
}

async fn send_frame<S>(sink: &mut S, frame: &RelayFrame) -> Result<(), Error>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = frame.to_text()?;
    sink.send(Message::text(text)).await?;
    Ok(())
}

async fn connection_loop(
    inner: Arc<RelayInner>,
    mut outgoing_rx: mpsc::UnboundedReceiver<RelayFrame>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut had_connection = false;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match connect_async(inner.url.as_str()).await {
            Ok((ws, _)) => {
                info!("RelayChannel connected to {}", inner.url);
                let (mut sink, mut stream) = ws.split();
                inner.connected.store(true, Ordering::Release);

                let mut alive = true;
                for key in inner.subscribed_keys() {
                    if let Err(e) = send_frame(&mut sink, &RelayFrame::Subscribe { key }).await {
                        warn!("RelayChannel {}: resubscribe failed => {}", inner.url, e);
                        alive = false;
                        break;
                    }
                }
                if alive && had_connection {
                    inner.deliver(ChannelEvent::Reconnected, None);
                }
                had_connection = true;

                while alive {
                    tokio::select! {
                        frame = outgoing_rx.recv() => match frame {
                            Some(frame) => {
                                if let Err(e) = send_frame(&mut sink, &frame).await {
                                    warn!("RelayChannel {}: send failed => {}", inner.url, e);
                                    alive = false;
                                }
                            }
                            None => alive = false,
                        },
                        msg = stream.next() => match msg {
                            Some(Ok(Message::Text(text))) => inner.handle_text(text.as_str()),
                            Some(Ok(Message::Close(_))) | None => {
                                info!("RelayChannel {}: connection closed", inner.url);
                                alive = false;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("RelayChannel {}: read failed => {}", inner.url, e);
                                alive = false;
                            }
                        },
                        _ = shutdown_rx.changed() => {
                            // Writes queued before the close still go out.
                            while let Ok(frame) = outgoing_rx.try_recv() {
                                if send_frame(&mut sink, &frame).await.is_err() {
                                    break;
                                }
                            }
                            let _ = sink.close().await;
                            alive = false;
                        }
                    }
                }
                inner.connected.store(false, Ordering::Release);
            }
            Err(e) => warn!("RelayChannel: connect to {} failed => {}", inner.url, e),
        }

        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
    debug!("RelayChannel loop for {} finished", inner.url);
}
