// tests/integration/toy_tests.rs
//
// The bundled toys wired into a dispatcher the way the server wires them.

use std::sync::Arc;
use std::time::Duration;

use toybox_core::chat::AuthorIndex;
use toybox_core::commands::{CommandRegistry, DispatchOutcome, Dispatcher, Rejection};
use toybox_core::eventbus::{BusEvent, EventBus};
use toybox_core::models::{ChatMessage, User};
use toybox_core::sync::LocalChannel;
use toybox_core::test_utils::MemoryLedger;
use toybox_core::toys::gamba::{send_request, RoundStatus};
use toybox_core::toys::{GambaAction, GambaToy, PointsToy, ShoutToy};
use toybox_core::traits::{PointsLedger, SyncChannel};

struct Stage {
    channel: Arc<dyn SyncChannel>,
    registry: Arc<CommandRegistry>,
    dispatcher: Arc<Dispatcher>,
    ledger: Arc<MemoryLedger>,
    authors: Arc<AuthorIndex>,
    bus: Arc<EventBus>,
    points: Arc<PointsToy>,
    gamba: Arc<GambaToy>,
    shout: Arc<ShoutToy>,
}

fn stage() -> Stage {
    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::in_memory());
    let ledger = Arc::new(MemoryLedger::new());
    let authors = Arc::new(AuthorIndex::new());
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(CommandRegistry::new(channel.clone()));
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), ledger.clone(), bus.clone()));

    let points = Arc::new(PointsToy::new(channel.clone(), ledger.clone(), authors.clone(), bus.clone()));
    let gamba = Arc::new(GambaToy::new(channel.clone(), ledger.clone(), bus.clone()));
    let shout = Arc::new(ShoutToy::new(channel.clone()));
    dispatcher.set_points_settings(points.settings());
    dispatcher.register_toy(points.descriptor());
    dispatcher.register_toy(gamba.descriptor());
    dispatcher.register_toy(shout.descriptor());
    points.settings().update(|s| s.enabled = true);

    Stage { channel, registry, dispatcher, ledger, authors, bus, points, gamba, shout }
}

impl Stage {
    fn seed(&self, id: &str, name: &str, points: i64) {
        let mut user = User::placeholder(id, name);
        user.points = points;
        self.ledger.insert(user);
        self.authors.record(id, name);
    }

    async fn say(&self, msg_id: &str, author_id: &str, name: &str, text: &str) -> DispatchOutcome {
        let msg = ChatMessage::text(msg_id, author_id, name, text);
        self.dispatcher.handle_message(&msg).await
    }

    async fn points_of(&self, id: &str) -> i64 {
        self.ledger.get_user(id).await.unwrap().map(|u| u.points).unwrap_or(0)
    }
}

/// Yields to spawned tasks until `check` holds, for up to a second.
async fn settle(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_give_moves_points_between_chatters() {
    let s = stage();
    s.seed("UC1", "@alice", 500);
    s.seed("UC2", "@bob", 0);

    let out = s.say("m1", "UC1", "@alice", "!give @bob 50").await;
    assert!(out.is_accepted());
    assert_eq!(s.points_of("UC1").await, 450);
    assert_eq!(s.points_of("UC2").await, 50);
    assert_eq!(s.ledger.usage_count("UC1", "points__give"), 1);

    let greedy = s.say("m2", "UC2", "@bob", "!give alice 5000").await;
    assert_eq!(
        greedy.rejection(),
        Some(&Rejection::Handler("you only have 50 points".into()))
    );

    let selfish = s.say("m3", "UC2", "@bob", "!give @bob 1").await;
    assert!(matches!(selfish.rejection(), Some(Rejection::Handler(r)) if r.contains("yourself")));
    assert_eq!(s.ledger.total_points(), 500);
}

#[tokio::test]
async fn test_gamba_round_pays_winners() {
    let s = stage();
    s.seed("UC1", "@alice", 500);
    s.seed("UC2", "@bob", 50);

    let early = s.say("m0", "UC1", "@alice", "!bet 10 a").await;
    assert!(matches!(early.rejection(), Some(Rejection::Handler(_))));

    s.gamba.open_round("who wins?", vec!["a".into(), "b".into()]).unwrap();
    assert!(s.say("m1", "UC1", "@alice", "!bet 100 a").await.is_accepted());
    assert!(s.say("m2", "UC2", "@bob", "!bet 30 2").await.is_accepted());
    assert_eq!(s.points_of("UC1").await, 400);
    assert_eq!(s.points_of("UC2").await, 20);

    let switch = s.say("m3", "UC2", "@bob", "!bet 5 a").await;
    assert!(matches!(switch.rejection(), Some(Rejection::Handler(r)) if r.contains("already bet")));

    s.gamba.close_round().unwrap();
    let late = s.say("m4", "UC1", "@alice", "!bet 10 a").await;
    assert!(!late.is_accepted());

    let payout = s.gamba.resolve("a").await.unwrap();
    assert_eq!(payout.pool, 130);
    assert_eq!(payout.remainder, 0);
    assert_eq!(s.points_of("UC1").await, 530);
    assert_eq!(s.points_of("UC2").await, 20);
    assert!(s.gamba.current_round().is_none());
}

#[tokio::test]
async fn test_give_counts_its_own_cost() {
    let s = stage();
    s.seed("UC1", "@alice", 50);
    s.seed("UC2", "@bob", 0);
    s.registry
        .update("points__give", |d| {
            d.cost_enabled = true;
            d.cost = 10;
        })
        .unwrap();

    let all_in = s.say("m1", "UC1", "@alice", "!give @bob 50").await;
    assert_eq!(all_in.rejection(), Some(&Rejection::Handler("you only have 50 points".into())));
    assert_eq!(s.points_of("UC1").await, 50);

    assert!(s.say("m2", "UC1", "@alice", "!give @bob 40").await.is_accepted());
    assert_eq!(s.points_of("UC1").await, 0);
    assert_eq!(s.points_of("UC2").await, 40);
}

#[tokio::test]
async fn test_host_runs_a_round_through_the_control_key() {
    let s = stage();
    s.seed("UC1", "@alice", 100);
    s.seed("UC2", "@bob", 100);
    let listener = s.gamba.clone().spawn_control_listener(s.bus.shutdown_rx.clone());

    send_request(
        s.channel.clone(),
        GambaAction::Open { title: "next map".into(), options: vec!["dust".into(), "nuke".into()] },
    );
    assert!(settle(|| s.gamba.current_round().is_some()).await);
    assert!(s.say("m1", "UC1", "@alice", "!bet 60 dust").await.is_accepted());
    assert!(s.say("m2", "UC2", "@bob", "!bet 40 nuke").await.is_accepted());

    send_request(s.channel.clone(), GambaAction::Close);
    assert!(settle(|| s.gamba.current_round().is_some_and(|r| r.status == RoundStatus::Closed)).await);
    assert!(!s.say("m3", "UC2", "@bob", "!bet 10 nuke").await.is_accepted());

    send_request(s.channel.clone(), GambaAction::Resolve { winner: "dust".into() });
    assert!(settle(|| s.gamba.current_round().is_none()).await);
    let mut paid = false;
    for _ in 0..100 {
        if s.points_of("UC1").await == 140 {
            paid = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(paid);
    assert_eq!(s.points_of("UC2").await, 60);

    s.bus.shutdown();
    listener.await.unwrap();
}

#[tokio::test]
async fn test_gamba_cancel_refunds_everyone() {
    let s = stage();
    s.seed("UC1", "@alice", 100);
    s.gamba.open_round("coin", vec!["heads".into(), "tails".into()]).unwrap();
    assert!(s.say("m1", "UC1", "@alice", "!bet 40 heads").await.is_accepted());
    assert_eq!(s.points_of("UC1").await, 60);

    assert_eq!(s.gamba.cancel().await.unwrap(), 1);
    assert_eq!(s.points_of("UC1").await, 100);
}

#[tokio::test(start_paused = true)]
async fn test_shout_is_charged_and_shares_a_cooldown() {
    let s = stage();
    s.seed("UC1", "@alice", 150);
    s.seed("UC2", "@bob", 150);

    let blank = s.say("m0", "UC1", "@alice", "!shout    ").await;
    assert!(matches!(blank.rejection(), Some(Rejection::MissingParam { .. })));
    assert_eq!(s.points_of("UC1").await, 150);

    let out = s.say("m1", "UC1", "@alice", "!shout hello everyone").await;
    assert!(out.is_accepted());
    assert_eq!(s.points_of("UC1").await, 50);
    assert_eq!(s.shout.last_shout().unwrap().message, "hello everyone");

    let blocked = s.say("m2", "UC2", "@bob", "!shout me too").await;
    assert!(matches!(blocked.rejection(), Some(Rejection::GroupCooldown { .. })));
    assert_eq!(s.points_of("UC2").await, 150);

    tokio::time::advance(Duration::from_secs(16)).await;
    assert!(s.say("m3", "UC2", "@bob", "!shout me too").await.is_accepted());
    assert_eq!(s.shout.last_shout().unwrap().author_id, "UC2");

    let broke = s.say("m4", "UC1", "@alice", "!shout again").await;
    assert!(!broke.is_accepted());
}

#[tokio::test]
async fn test_costs_are_free_while_economy_is_off() {
    let s = stage();
    s.points.settings().update(|st| st.enabled = false);
    s.seed("UC1", "@alice", 0);

    assert!(s.say("m1", "UC1", "@alice", "!shout free").await.is_accepted());
    assert_eq!(s.points_of("UC1").await, 0);

    let give = s.say("m2", "UC1", "@alice", "!give @alice 1").await;
    assert!(matches!(give.rejection(), Some(Rejection::Handler(r)) if r.contains("switched off")));
}

#[tokio::test]
async fn test_chatting_earns_rewards() {
    let s = stage();
    let rx = s.bus.subscribe(None).await;
    let task = s.points.clone().spawn_chat_rewards(rx);

    let batch = vec![
        ChatMessage::text("m1", "UC7", "@lurker", "hi"),
        ChatMessage::text("m2", "UC7", "@lurker", "hello again"),
    ];
    s.dispatcher.on_chat_batch(&batch).await;

    let mut rewarded = false;
    for _ in 0..100 {
        if s.points_of("UC7").await == 1 {
            rewarded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(rewarded);

    s.bus.shutdown();
    task.await.unwrap();
    assert_eq!(s.points_of("UC7").await, 1);
}

#[tokio::test]
async fn test_points_command_reports_balance() {
    let s = stage();
    s.seed("UC1", "@alice", 42);
    let mut rx = s.bus.subscribe(None).await;

    assert!(s.say("m1", "UC1", "@alice", "!points").await.is_accepted());

    let mut lines = Vec::new();
    while let Ok(evt) = rx.try_recv() {
        if let BusEvent::SystemMessage(line) = evt {
            lines.push(line);
        }
    }
    assert_eq!(lines, vec!["@alice has 42 points".to_string()]);
}
