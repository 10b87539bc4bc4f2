// tests/integration/sync_tests.rs

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::tempdir;

use toybox_core::sync::{LocalChannel, SyncedValue};
use toybox_core::traits::{StampedValue, SyncChannel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Scoreboard {
    home: i64,
    away: i64,
}

fn stamped(key: &str, value: serde_json::Value, timestamp: i64, origin: &str) -> StampedValue {
    StampedValue { key: key.into(), value, timestamp, origin: origin.into() }
}

#[test]
fn test_stale_echo_does_not_roll_back() {
    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::in_memory());
    let value = SyncedValue::new(channel.clone(), "x", json!(null));
    let heard = Arc::new(Mutex::new(Vec::new()));
    let h = heard.clone();
    value.on_change(move |v| h.lock().push(v.clone()));

    channel.publish(stamped("x", json!({"v": 2}), 100, "A"));
    channel.publish(stamped("x", json!({"v": 1}), 90, "B"));

    assert_eq!(value.get(), json!({"v": 2}));
    assert_eq!(value.timestamp(), 100);
    assert_eq!(heard.lock().as_slice(), &[json!({"v": 2})]);
}

#[test]
fn test_two_handles_converge() {
    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::in_memory());
    let left = SyncedValue::new(channel.clone(), "score", Scoreboard { home: 0, away: 0 });
    let right = SyncedValue::new(channel.clone(), "score", Scoreboard { home: 0, away: 0 });

    left.update(|s| s.home += 1);
    right.update(|s| s.away += 2);

    assert_eq!(left.get(), Scoreboard { home: 1, away: 2 });
    assert_eq!(right.get(), left.get());
    assert!(right.timestamp() > 0);
}

#[test]
fn test_late_joiner_adopts_existing_value() {
    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::in_memory());
    let first = SyncedValue::new(channel.clone(), "score", Scoreboard { home: 0, away: 0 });
    first.set(Scoreboard { home: 3, away: 1 });

    let late = SyncedValue::new(channel, "score", Scoreboard { home: 0, away: 0 });
    assert_eq!(late.get(), Scoreboard { home: 3, away: 1 });
}

#[test]
fn test_disposed_handle_stops_listening() {
    let local = Arc::new(LocalChannel::in_memory());
    let channel: Arc<dyn SyncChannel> = local.clone();
    let value = SyncedValue::new(channel.clone(), "n", 0i64);
    let other = SyncedValue::new(channel, "n", 0i64);
    assert_eq!(local.subscriber_count(), 2);

    value.dispose();
    assert!(value.is_disposed());
    assert_eq!(local.subscriber_count(), 1);

    other.set(7);
    assert_eq!(value.get(), 0);

    // Writes to a disposed handle stay local.
    value.set(9);
    assert_eq!(other.get(), 7);
}

#[test]
fn test_snapshot_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::with_snapshot(&path).unwrap());
        let value = SyncedValue::new(channel, "score", Scoreboard { home: 0, away: 0 });
        value.set(Scoreboard { home: 4, away: 4 });
    }
    assert!(path.exists());

    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::with_snapshot(&path).unwrap());
    let value = SyncedValue::new(channel, "score", Scoreboard { home: 0, away: 0 });
    assert_eq!(value.get(), Scoreboard { home: 4, away: 4 });
}

#[test]
fn test_snapshot_reload_delivers_other_process_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");

    let ours = Arc::new(LocalChannel::with_snapshot(&path).unwrap());
    let value = SyncedValue::new(ours.clone() as Arc<dyn SyncChannel>, "n", 0i64);

    // A second process sharing the file.
    let theirs = LocalChannel::with_snapshot(&path).unwrap();
    theirs.publish(stamped("n", json!(42), value.timestamp() + 1_000, "other-process"));

    assert_eq!(ours.reload_snapshot().unwrap(), 1);
    assert_eq!(value.get(), 42);
    assert_eq!(ours.reload_snapshot().unwrap(), 0);
}

#[test]
fn test_two_writers_on_one_file_lose_nothing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");

    let ours: Arc<dyn SyncChannel> = Arc::new(LocalChannel::with_snapshot(&path).unwrap());
    let theirs: Arc<dyn SyncChannel> = Arc::new(LocalChannel::with_snapshot(&path).unwrap());
    let volume = SyncedValue::new(ours, "volume", 0u32);
    let score = SyncedValue::new(theirs, "score", Scoreboard { home: 0, away: 0 });

    volume.set(7);
    score.set(Scoreboard { home: 2, away: 1 });

    // A third process starting now sees both writes.
    let later: Arc<dyn SyncChannel> = Arc::new(LocalChannel::with_snapshot(&path).unwrap());
    assert_eq!(SyncedValue::new(later.clone(), "volume", 0u32).get(), 7);
    assert_eq!(
        SyncedValue::new(later, "score", Scoreboard { home: 0, away: 0 }).get(),
        Scoreboard { home: 2, away: 1 }
    );
}
