//! src/sync/synced_value.rs

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use toybox_common::traits::{ChannelCallback, ChannelEvent, StampedValue, SubscriptionId, SyncChannel};

use crate::utils::time::current_millis;

pub type ListenerId = u64;
type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct State<T> {
    value: T,
    /// Stamp of the write `value` came from; 0 means "never written".
    timestamp: i64,
}

struct Shared<T> {
    key: String,
    origin: String,
    channel: Arc<dyn SyncChannel>,
    state: Mutex<State<T>>,
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
    next_listener: AtomicU64,
    subscription: Mutex<Option<SubscriptionId>>,
    disposed: AtomicBool,
}

/// A value kept consistent with every other holder of the same key.
///
/// Writes are stamped with wall-clock milliseconds and arbitrated
/// last-write-wins: an incoming write is applied only when its stamp is
/// strictly newer than the one we hold. Listeners registered with
/// [`SyncedValue::on_change`] hear about writes made by *other* handles;
/// a handle's own `set` never echoes back to it.
///
/// Clones share one handle. The channel subscription is released by
/// [`SyncedValue::dispose`], or when the last clone is dropped.
pub struct SyncedValue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SyncedValue<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T> SyncedValue<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Opens a handle on `key`. If the channel already holds a value for the
    /// key, it wins over `initial`.
    pub fn new(channel: Arc<dyn SyncChannel>, key: &str, initial: T) -> Self {
        let shared = Arc::new(Shared {
            key: key.to_string(),
            origin: Uuid::new_v4().to_string(),
            channel: channel.clone(),
            state: Mutex::new(State { value: initial, timestamp: 0 }),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            subscription: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        if let Some(existing) = channel.get_current(key) {
            shared.adopt(existing);
        }

        let weak: Weak<Shared<T>> = Arc::downgrade(&shared);
        let callback: ChannelCallback = Arc::new(move |event: ChannelEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_event(event);
            }
        });
        let id = channel.subscribe(key, callback);
        *shared.subscription.lock() = Some(id);

        // Anything published between the first read and the subscription.
        if let Some(existing) = channel.get_current(key) {
            shared.adopt(existing);
        }

        Self { shared }
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn get(&self) -> T {
        self.shared.state.lock().value.clone()
    }

    /// Runs `f` against the current value without cloning it.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.shared.state.lock().value)
    }

    /// Stamp of the value currently held, 0 if nobody ever wrote it.
    pub fn timestamp(&self) -> i64 {
        self.shared.state.lock().timestamp
    }

    /// Replaces the value locally and pushes it to the channel.
    pub fn set(&self, value: T) {
        self.update(move |v| *v = value);
    }

    /// Read-modify-write of the local value, published as one write.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let (result, stamped) = {
            let mut state = self.shared.state.lock();
            let result = f(&mut state.value);
            // Strictly increasing even when two writes land in the same ms.
            state.timestamp = current_millis().max(state.timestamp + 1);
            let stamped = self.shared.stamp(&state);
            (result, stamped)
        };
        if let Some(stamped) = stamped {
            self.shared.publish(stamped);
        }
        result
    }

    /// Registers `callback` for writes arriving from other handles.
    pub fn on_change(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.shared.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    /// Drops the channel subscription and all listeners now. Later `set`
    /// calls only change the local copy.
    pub fn dispose(&self) {
        self.shared.release();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }
}

impl<T> Shared<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn stamp(&self, state: &State<T>) -> Option<StampedValue> {
        match serde_json::to_value(&state.value) {
            Ok(value) => Some(StampedValue {
                key: self.key.clone(),
                value,
                timestamp: state.timestamp,
                origin: self.origin.clone(),
            }),
            Err(e) => {
                error!("SyncedValue '{}': cannot serialize value => {}", self.key, e);
                None
            }
        }
    }

    fn publish(&self, stamped: StampedValue) {
        if self.disposed.load(Ordering::Acquire) {
            debug!("SyncedValue '{}' is disposed; keeping write local", self.key);
            return;
        }
        self.channel.publish(stamped);
    }

    /// Takes an existing channel value at creation time, without notifying.
    fn adopt(&self, existing: StampedValue) {
        let mut state = self.state.lock();
        if existing.timestamp <= state.timestamp {
            return;
        }
        match serde_json::from_value::<T>(existing.value) {
            Ok(v) => {
                state.value = v;
                state.timestamp = existing.timestamp;
            }
            Err(e) => warn!("SyncedValue '{}': ignoring unreadable stored value => {}", self.key, e),
        }
    }

    fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Update(update) => self.apply_remote(update),
            ChannelEvent::Reconnected => self.republish(),
        }
    }

    fn apply_remote(&self, update: StampedValue) {
        if update.origin == self.origin {
            return;
        }
        let new_value = {
            let mut state = self.state.lock();
            if update.timestamp <= state.timestamp {
                debug!(
                    "SyncedValue '{}': dropping stale write ts={} (have ts={})",
                    self.key, update.timestamp, state.timestamp
                );
                return;
            }
            match serde_json::from_value::<T>(update.value) {
                Ok(v) => {
                    state.value = v.clone();
                    state.timestamp = update.timestamp;
                    v
                }
                Err(e) => {
                    warn!("SyncedValue '{}': unreadable remote write => {}", self.key, e);
                    return;
                }
            }
        };

        let listeners: Vec<Listener<T>> =
            self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&new_value);
        }
    }

    /// Sends what we hold again so peers that missed it while we were
    /// disconnected catch up. Keeps the original stamp.
    fn republish(&self) {
        let stamped = {
            let state = self.state.lock();
            if state.timestamp == 0 {
                return;
            }
            self.stamp(&state)
        };
        if let Some(stamped) = stamped {
            debug!("SyncedValue '{}': republishing after reconnect", self.key);
            self.publish(stamped);
        }
    }

    fn release(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.subscription.lock().take() {
            self.channel.unsubscribe(id);
        }
        self.listeners.lock().clear();
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.get_mut().take() {
            self.channel.unsubscribe(id);
        }
    }
}
