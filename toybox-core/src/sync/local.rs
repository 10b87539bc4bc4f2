//! src/sync/local.rs
//!
//! In-process sync channel. Optionally mirrors its newest values to a JSON
//! snapshot file so several processes on one machine can share state through
//! the file, the way browser windows share local storage.
//!
//! Writers never replace the file wholesale: each write re-reads it under
//! `<snapshot>.lock` and keeps the newest stamp per key, so keys written by
//! another process survive.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use toybox_common::traits::{ChannelCallback, ChannelEvent, StampedValue, SubscriptionId, SyncChannel};

use crate::Error;

const LOCK_ATTEMPTS: u32 = 200;
const LOCK_RETRY: Duration = Duration::from_millis(5);

pub struct LocalChannel {
    values: RwLock<HashMap<String, StampedValue>>,
    subscribers: Mutex<HashMap<SubscriptionId, (String, ChannelCallback)>>,
    next_id: AtomicU64,
    snapshot_path: Option<PathBuf>,
}

impl LocalChannel {
    pub fn in_memory() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            snapshot_path: None,
        }
    }

    /// Opens a channel backed by `path`, loading whatever the file holds.
    /// A missing file starts empty; an unreadable one is an error.
    pub fn with_snapshot(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            read_snapshot(&path)?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            HashMap::new()
        };
        info!("LocalChannel: {} key(s) loaded from {}", values.len(), path.display());
        Ok(Self {
            values: RwLock::new(values),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            snapshot_path: Some(path),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Merges newer values written to the snapshot file by other processes
    /// and delivers them to local subscribers. Returns how many keys changed.
    pub fn reload_snapshot(&self) -> Result<usize, Error> {
        let Some(path) = &self.snapshot_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }
        let on_disk = read_snapshot(path)?;
        let changed = merge_newer(&mut self.values.write(), on_disk);
        let count = changed.len();
        for stamped in changed {
            self.deliver(ChannelEvent::Update(stamped.clone()), Some(&stamped.key));
        }
        Ok(count)
    }

    fn deliver(&self, event: ChannelEvent, key: Option<&str>) {
        // Never call out while holding the map; callbacks may subscribe,
        // unsubscribe or publish.
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

    fn persist(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        if let Err(e) = self.write_merged(path) {
            warn!("LocalChannel: failed to write snapshot {} => {}", path.display(), e);
        }
    }

    fn write_merged(&self, path: &Path) -> Result<(), Error> {
        let _lock = SnapshotLock::acquire(path)?;
        let mut merged = if path.exists() {
            match read_snapshot(path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("LocalChannel: replacing unreadable snapshot {} => {}", path.display(), e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        let ours = self.values.read().clone();
        merge_newer(&mut merged, ours);

        let json = serde_json::to_vec_pretty(&merged)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Copies every entry of `from` whose stamp beats the one in `into`.
/// Returns the entries that were taken.
fn merge_newer(
    into: &mut HashMap<String, StampedValue>,
    from: HashMap<String, StampedValue>,
) -> Vec<StampedValue> {
    let mut taken = Vec::new();
    for (key, stamped) in from {
        let newer = into
            .get(&key)
            .map_or(true, |cur| stamped.timestamp > cur.timestamp);
        if newer {
            into.insert(key, stamped.clone());
            taken.push(stamped);
        }
    }
    taken
}

/// Exclusive hold on the snapshot across processes, released on drop.
struct SnapshotLock {
    path: PathBuf,
}

impl SnapshotLock {
    fn acquire(snapshot: &Path) -> Result<Self, Error> {
        let path = snapshot.with_extension("lock");
        for _ in 0..LOCK_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => std::thread::sleep(LOCK_RETRY),
                Err(e) => return Err(e.into()),
            }
        }
        // Left behind by a process that died mid-write.
        warn!("LocalChannel: taking over stale lock {}", path.display());
        Ok(Self { path })
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("LocalChannel: could not remove {} => {}", self.path.display(), e);
        }
    }
}

fn read_snapshot(path: &Path) -> Result<HashMap<String, StampedValue>, Error> {
    let raw = std::fs::read(path)?;
    if raw.is_empty() {
        return Ok(HashMap::new());
    }
    Ok(serde_json::from_slice(&raw)?)
}

impl SyncChannel for LocalChannel {
    fn publish(&self, update: StampedValue) {
        let newer = {
            let mut values = self.values.write();
            let newer = values
                .get(&update.key)
                .map_or(true, |cur| update.timestamp > cur.timestamp);
            if newer {
                values.insert(update.key.clone(), update.clone());
            }
            newer
        };
        if newer {
            self.persist();
        }
        let key = update.key.clone();
        self.deliver(ChannelEvent::Update(update), Some(&key));
    }

    fn subscribe(&self, key: &str, callback: ChannelCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, (key.to_string(), callback));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().remove(&id);
    }

    fn get_current(&self, key: &str) -> Option<StampedValue> {
        self.values.read().get(key).cloned()
    }
}

/// Re-reads the snapshot file every `every` until shutdown is signalled.
pub fn spawn_snapshot_watch(
    channel: Arc<LocalChannel>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown_rx.changed() => {}
            }
            if *shutdown_rx.borrow() {
                debug!("LocalChannel snapshot watch stopping");
                break;
            }
            match channel.reload_snapshot() {
                Ok(0) => {}
                Ok(n) => debug!("LocalChannel: picked up {} key(s) from snapshot", n),
                Err(e) => warn!("LocalChannel: snapshot reload failed => {}", e),
            }
        }
    })
}
