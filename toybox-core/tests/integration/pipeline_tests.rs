// tests/integration/pipeline_tests.rs
//
// Raw chat payload -> ingest -> dispatcher -> ledger / event bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use mockall::mock;
use parking_lot::Mutex;
use serde_json::{json, Value};

use toybox_core::chat::{AuthorIndex, ChatIngest};
use toybox_core::commands::{
    CommandHandler, CommandInvocation, CommandRegistry, DispatchOutcome, Dispatcher, Handshake, Rejection,
};
use toybox_core::eventbus::{BusEvent, EventBus};
use toybox_core::models::{
    CommandDefinition, CommandParam, DispatchEvent, ParamType, ParamValue, Params, User, UserUpdate,
};
use toybox_core::sync::{LocalChannel, SyncedValue};
use toybox_core::test_utils::MemoryLedger;
use toybox_core::toys::{PointsSettings, ToyDescriptor};
use toybox_core::traits::{PointsLedger, SyncChannel};
use toybox_core::Error;

mock! {
    Ledger {}
    #[async_trait]
    impl PointsLedger for Ledger {
        async fn get_user(&self, id: &str) -> Result<Option<User>, Error>;
        async fn update_user(&self, id: &str, update: &UserUpdate) -> Result<(), Error>;
        async fn ban(&self, id: &str) -> Result<(), Error>;
        async fn unban(&self, id: &str) -> Result<(), Error>;
        async fn find_by_display_name(&self, name: &str) -> Result<Vec<User>, Error>;
        async fn top_users(&self, limit: i64) -> Result<Vec<User>, Error>;
    }
}

fn text_action(id: &str, author: &str, text: &str, member: bool) -> Value {
    let badges = if member {
        json!([{ "liveChatAuthorBadgeRenderer": { "customThumbnail": { "thumbnails": [] } } }])
    } else {
        json!([])
    };
    json!({
        "addChatItemAction": { "item": { "liveChatTextMessageRenderer": {
            "id": id,
            "authorExternalChannelId": author,
            "authorName": { "simpleText": format!("@{author}") },
            "authorBadges": badges,
            "message": { "runs": [{ "text": text }] }
        }}}
    })
}

fn payload(actions: Vec<Value>) -> Value {
    json!({ "continuationContents": { "liveChatContinuation": { "actions": actions } } })
}

/// Accepts everything and remembers the params it was given.
fn recording_handler(seen: Arc<Mutex<Vec<Params>>>) -> CommandHandler {
    Arc::new(move |inv: CommandInvocation, hs: Handshake| {
        seen.lock().push(inv.params.clone());
        async move {
            hs.accept();
        }
        .boxed()
    })
}

struct Pipeline {
    ingest: ChatIngest,
    dispatcher: Arc<Dispatcher>,
    ledger: Arc<MemoryLedger>,
    channel: Arc<dyn SyncChannel>,
    seen: Arc<Mutex<Vec<Params>>>,
}

impl Pipeline {
    fn new(owner: &str, commands: Vec<CommandDefinition>) -> Self {
        let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::in_memory());
        let ledger = Arc::new(MemoryLedger::new());
        let registry = Arc::new(CommandRegistry::new(channel.clone()));
        let dispatcher = Arc::new(Dispatcher::new(registry, ledger.clone(), Arc::new(EventBus::new())));
        let seen = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register_toy(ToyDescriptor {
            slug: owner.to_string(),
            name: owner.to_string(),
            commands,
            handler: recording_handler(seen.clone()),
        });
        Self {
            ingest: ChatIngest::new(Arc::new(AuthorIndex::new())),
            dispatcher,
            ledger,
            channel,
            seen,
        }
    }

    fn enable_economy(&self) {
        let settings = SyncedValue::new(
            self.channel.clone(),
            "settings:points",
            PointsSettings { enabled: true, ..Default::default() },
        );
        self.dispatcher.set_points_settings(settings);
    }

    async fn feed(&mut self, actions: Vec<Value>) -> Vec<DispatchOutcome> {
        let messages = self.ingest.handle_raw_payload(&payload(actions));
        self.dispatcher.on_chat_batch(&messages).await
    }
}

fn bet_definition() -> CommandDefinition {
    CommandDefinition::new("gamba", "bet")
        .with_param(CommandParam::required("amount", ParamType::Number))
        .with_param(CommandParam::required("option", ParamType::String))
        .with_cooldown(30)
}

#[tokio::test]
async fn test_bet_parses_and_records_cooldown_without_charging() {
    let mut p = Pipeline::new("gamba", vec![bet_definition()]);
    p.enable_economy();

    let out = p.feed(vec![text_action("m1", "UC1", "!bet 100 a", false)]).await;
    assert_eq!(out, vec![DispatchOutcome::Accepted { slug: "gamba__bet".into() }]);

    let seen = p.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get("amount"), Some(&ParamValue::Number(100.0)));
    assert_eq!(seen[0].get("option"), Some(&ParamValue::Text("a".into())));

    let user = p.ledger.get_user("UC1").await.unwrap().unwrap();
    assert_eq!(user.points, 0);
    assert_eq!(user.points_spent, 0);
    assert_eq!(
        p.dispatcher.cooldowns().user_remaining("gamba__bet", "UC1", 30),
        Some(30)
    );
}

#[tokio::test]
async fn test_insufficient_points_leaves_ledger_untouched() {
    let mut p = Pipeline::new("fx", vec![CommandDefinition::new("fx", "horn").with_cost(100)]);
    p.enable_economy();
    let mut poor = User::placeholder("UC1", "@UC1");
    poor.points = 50;
    p.ledger.insert(poor.clone());

    let out = p.feed(vec![text_action("m1", "UC1", "!horn", false)]).await;
    assert_eq!(
        out[0].rejection(),
        Some(&Rejection::InsufficientPoints { command: "horn".into(), cost: 100, points: 50 })
    );
    assert!(out[0].rejection().unwrap().to_string().contains("only have 50"));
    assert_eq!(p.ledger.get_user("UC1").await.unwrap().unwrap(), poor);
    assert_eq!(p.ledger.usage_count("UC1", "fx__horn"), 0);
    assert!(p.seen.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rapid_repeat_hits_cooldown() {
    let mut p = Pipeline::new("buddy", vec![CommandDefinition::new("buddy", "pat").with_cooldown(5)]);

    let first = p.feed(vec![text_action("m1", "UC1", "!pat", false)]).await;
    assert!(first[0].is_accepted());

    tokio::time::advance(Duration::from_millis(1200)).await;
    let second = p.feed(vec![text_action("m2", "UC1", "!pat", false)]).await;
    let rejection = second[0].rejection().cloned().unwrap();
    assert_eq!(rejection, Rejection::Cooldown { command: "pat".into(), remaining: 4 });
    assert!(rejection.to_string().contains("try again in 4 seconds"));

    // Another chatter is not affected.
    let other = p.feed(vec![text_action("m3", "UC2", "!pat", false)]).await;
    assert!(other[0].is_accepted());
}

#[tokio::test]
async fn test_empty_actions_dispatch_nothing() {
    let mut p = Pipeline::new("buddy", vec![CommandDefinition::new("buddy", "pat")]);
    let out = p.feed(vec![]).await;
    assert!(out.is_empty());
    assert!(p.seen.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_member_gate_differs_from_cooldown() {
    let mut p = Pipeline::new(
        "buddy",
        vec![CommandDefinition::new("buddy", "hug").members_only().with_cooldown(60)],
    );

    let not_member = p.feed(vec![text_action("m1", "UC1", "!hug", false)]).await;
    let member_first = p.feed(vec![text_action("m2", "UC2", "!hug", true)]).await;
    let member_again = p.feed(vec![text_action("m3", "UC2", "!hug", true)]).await;

    let gate = not_member[0].rejection().cloned().unwrap();
    let cooldown = member_again[0].rejection().cloned().unwrap();
    assert!(matches!(gate, Rejection::MemberOnly { .. }));
    assert!(matches!(cooldown, Rejection::Cooldown { .. }));
    assert_ne!(gate.to_string(), cooldown.to_string());
    assert!(member_first[0].is_accepted());
}

#[tokio::test]
async fn test_duplicate_ids_dispatch_once() {
    let mut p = Pipeline::new("buddy", vec![CommandDefinition::new("buddy", "pat")]);
    let a = text_action("same", "UC1", "!pat", false);
    let out = p.feed(vec![a.clone(), a.clone()]).await;
    assert_eq!(out.len(), 1);
    let again = p.feed(vec![a]).await;
    assert!(again.is_empty());
    assert_eq!(p.seen.lock().len(), 1);
}

#[tokio::test]
async fn test_dispatch_events_reach_bus() {
    let mut p = Pipeline::new("buddy", vec![CommandDefinition::new("buddy", "pat").members_only()]);
    let mut rx = p.dispatcher.event_bus().subscribe(None).await;

    p.feed(vec![
        text_action("m1", "UC1", "just chatting", false),
        text_action("m2", "UC1", "!pat", false),
        text_action("m3", "UC2", "!pat", true),
    ])
    .await;

    let mut dispatches: Vec<DispatchEvent> = Vec::new();
    let mut chat_lines = 0;
    while let Ok(evt) = rx.try_recv() {
        match evt {
            BusEvent::ChatMessage(_) => chat_lines += 1,
            BusEvent::Dispatch(d) => dispatches.push(d),
            BusEvent::SystemMessage(_) => {}
        }
    }
    assert_eq!(chat_lines, 3);
    assert_eq!(dispatches.len(), 2);
    assert!(!dispatches[0].is_accepted());
    assert_eq!(dispatches[0].user_id(), "UC1");
    assert!(dispatches[1].is_accepted());
    assert_eq!(dispatches[1].command_slug(), "buddy__pat");
}

#[tokio::test]
async fn test_ledger_failure_drops_message_without_cooldown() {
    let mut ledger = MockLedger::new();
    ledger.expect_get_user().returning(|_| Ok(None));
    ledger
        .expect_update_user()
        .times(1)
        .returning(|_, _| Err(Error::Platform("disk full".into())));

    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::in_memory());
    let registry = Arc::new(CommandRegistry::new(channel));
    let bus = Arc::new(EventBus::new());
    let dispatcher = Dispatcher::new(registry, Arc::new(ledger), bus.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));
    dispatcher.register_toy(ToyDescriptor {
        slug: "buddy".into(),
        name: "Buddy".into(),
        commands: vec![CommandDefinition::new("buddy", "pat").with_cooldown(5)],
        handler: recording_handler(seen),
    });
    let mut rx = bus.subscribe(None).await;

    let msg = toybox_core::models::ChatMessage::text("m1", "UC1", "@a", "!pat");
    let out = dispatcher.handle_message(&msg).await;
    assert_eq!(out, DispatchOutcome::Dropped { slug: "buddy__pat".into() });
    assert!(dispatcher.cooldowns().user_remaining("buddy__pat", "UC1", 5).is_none());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_user_lookup_failure_is_contained() {
    let mut ledger = MockLedger::new();
    ledger
        .expect_get_user()
        .returning(|_| Err(Error::Platform("offline".into())));
    ledger.expect_update_user().never();

    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::in_memory());
    let dispatcher = Dispatcher::new(
        Arc::new(CommandRegistry::new(channel)),
        Arc::new(ledger),
        Arc::new(EventBus::new()),
    );
    dispatcher.register_toy(ToyDescriptor {
        slug: "buddy".into(),
        name: "Buddy".into(),
        commands: vec![CommandDefinition::new("buddy", "pat")],
        handler: recording_handler(Arc::new(Mutex::new(Vec::new()))),
    });

    let batch = vec![
        toybox_core::models::ChatMessage::text("m1", "UC1", "@a", "!pat"),
        toybox_core::models::ChatMessage::text("m2", "UC1", "@a", "hello"),
    ];
    let out = dispatcher.on_chat_batch(&batch).await;
    assert_eq!(out[0], DispatchOutcome::Dropped { slug: "buddy__pat".into() });
    assert_eq!(out[1], DispatchOutcome::Ignored);
}
