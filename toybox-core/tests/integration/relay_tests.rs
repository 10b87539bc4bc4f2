// tests/integration/relay_tests.rs

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use toybox_core::commands::registry::COMMANDS_KEY;
use toybox_core::commands::CommandRegistry;
use toybox_core::models::CommandDefinition;
use toybox_core::sync::{RelayChannel, RelayHub, SyncedValue};
use toybox_core::traits::{StampedValue, SyncChannel};

async fn start_hub() -> (Arc<RelayHub>, String, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hub = Arc::new(RelayHub::new());
    let (tx, rx) = watch::channel(false);
    tokio::spawn(hub.clone().serve(listener, rx));
    (hub, format!("ws://{addr}"), tx)
}

/// Polls `check` every 20ms for up to 5s.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_processes_converge_through_hub() {
    let (hub, url, shutdown) = start_hub().await;

    let a: Arc<dyn SyncChannel> = Arc::new(RelayChannel::connect(&url));
    let b: Arc<dyn SyncChannel> = Arc::new(RelayChannel::connect(&url));
    let left = SyncedValue::new(a, "toy:shout", None::<String>);
    let right = SyncedValue::new(b, "toy:shout", None::<String>);

    left.set(Some("hello".into()));
    assert!(eventually(|| right.get().as_deref() == Some("hello")).await);
    assert!(hub.current("toy:shout").is_some());

    right.set(Some("world".into()));
    assert!(eventually(|| left.get().as_deref() == Some("world")).await);

    let _ = shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_subscriber_receives_current_value() {
    let (_hub, url, shutdown) = start_hub().await;

    let writer_channel = Arc::new(RelayChannel::connect(&url));
    let writer = SyncedValue::new(writer_channel.clone() as Arc<dyn SyncChannel>, "volume", 0u32);
    assert!(eventually(|| writer_channel.is_connected()).await);
    writer.set(11);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let reader_channel: Arc<dyn SyncChannel> = Arc::new(RelayChannel::connect(&url));
    let reader = SyncedValue::new(reader_channel, "volume", 0u32);
    assert!(eventually(|| reader.get() == 11).await);
    assert_eq!(reader.timestamp(), writer.timestamp());

    writer_channel.shutdown().await;
    assert!(!writer_channel.is_connected());
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_hub_drops_stale_writes() {
    let hub = RelayHub::new();
    let fresh = StampedValue { key: "x".into(), value: json!(2), timestamp: 100, origin: "A".into() };
    let stale = StampedValue { key: "x".into(), value: json!(1), timestamp: 90, origin: "B".into() };

    assert!(hub.accept_update(fresh.clone()));
    assert!(!hub.accept_update(stale));
    assert_eq!(hub.current("x"), Some(fresh));
}

fn buddy_defaults() -> Vec<CommandDefinition> {
    vec![
        CommandDefinition::new("buddy", "pat").with_cooldown(5),
        CommandDefinition::new("buddy", "hug"),
    ]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_keeps_edits_held_by_hub() {
    let (hub, url, shutdown) = start_hub().await;

    // First run: seed defaults and let the streamer edit one.
    let first = Arc::new(RelayChannel::connect(&url));
    assert!(first.prime(&[COMMANDS_KEY], Duration::from_secs(5)).await);
    let registry = CommandRegistry::new(first.clone() as Arc<dyn SyncChannel>);
    registry.reconcile(buddy_defaults(), "buddy");
    registry.update("buddy__pat", |d| d.cool_down = 30).unwrap();
    assert!(eventually(|| hub.current(COMMANDS_KEY).is_some_and(|v| v.value["buddy__pat"]["coolDown"] == 30)).await);
    registry.dispose();
    first.shutdown().await;

    // Second run, same start-up order as the server.
    let second = Arc::new(RelayChannel::connect(&url));
    assert!(second.prime(&[COMMANDS_KEY], Duration::from_secs(5)).await);
    let registry = CommandRegistry::new(second.clone() as Arc<dyn SyncChannel>);
    let effective = registry.reconcile(buddy_defaults(), "buddy");

    let pat = effective.iter().find(|d| d.slug == "buddy__pat").unwrap();
    assert_eq!(pat.cool_down, 30);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.current(COMMANDS_KEY).unwrap().value["buddy__pat"]["coolDown"], 30);
    assert_eq!(registry.get("buddy__pat").unwrap().cool_down, 30);

    second.shutdown().await;
    let _ = shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_prime_answers_for_keys_the_hub_never_saw() {
    let (_hub, url, shutdown) = start_hub().await;
    let relay = RelayChannel::connect(&url);
    assert!(relay.prime(&["never-written", "also-new"], Duration::from_secs(5)).await);
    assert!(relay.get_current("never-written").is_none());
    relay.shutdown().await;
    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_prime_gives_up_without_a_hub() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let relay = RelayChannel::connect(&format!("ws://{addr}"));
    assert!(!relay.prime(&[COMMANDS_KEY], Duration::from_millis(300)).await);
    relay.shutdown().await;
}
