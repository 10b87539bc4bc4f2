// File: src/toys/points.rs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use toybox_common::models::{ChatMessage, CommandDefinition, CommandParam, ParamType, UserUpdate};
use toybox_common::traits::{PointsLedger, SyncChannel};

use crate::chat::AuthorIndex;
use crate::commands::{CommandInvocation, Handshake};
use crate::eventbus::{BusEvent, EventBus};
use crate::sync::SyncedValue;
use crate::toys::ToyDescriptor;

pub const SETTINGS_KEY: &str = "settings:points";

/// Economy settings shared by every surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointsSettings {
    /// Master switch. While off, command costs are not charged.
    pub enabled: bool,
    /// Points granted for chatting.
    pub chat_reward: i64,
    /// Seconds between two chat rewards for the same chatter.
    pub chat_reward_cooldown: u64,
}

impl Default for PointsSettings {
    fn default() -> Self {
        Self { enabled: false, chat_reward: 1, chat_reward_cooldown: 60 }
    }
}

pub struct PointsToy {
    ledger: Arc<dyn PointsLedger>,
    authors: Arc<AuthorIndex>,
    settings: SyncedValue<PointsSettings>,
    event_bus: Arc<EventBus>,
    last_reward: Mutex<HashMap<String, Instant>>,
}

impl PointsToy {
    pub const SLUG: &'static str = "points";

    pub fn new(
        channel: Arc<dyn SyncChannel>,
        ledger: Arc<dyn PointsLedger>,
        authors: Arc<AuthorIndex>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            ledger,
            authors,
            settings: SyncedValue::new(channel, SETTINGS_KEY, PointsSettings::default()),
            event_bus,
            last_reward: Mutex::new(HashMap::new()),
        }
    }

    /// Handle on the shared settings; the dispatcher reads the economy
    /// switch from it.
    pub fn settings(&self) -> SyncedValue<PointsSettings> {
        self.settings.clone()
    }

    pub fn default_commands() -> Vec<CommandDefinition> {
        vec![
            CommandDefinition::new(Self::SLUG, "points").with_cooldown(10),
            CommandDefinition::new(Self::SLUG, "give")
                .with_param(CommandParam::required("target", ParamType::Username))
                .with_param(CommandParam::required("amount", ParamType::Number))
                .with_cooldown(5),
        ]
    }

    pub fn descriptor(self: &Arc<Self>) -> ToyDescriptor {
        let toy = self.clone();
        ToyDescriptor {
            slug: Self::SLUG.to_string(),
            name: "Points".to_string(),
            commands: Self::default_commands(),
            handler: Arc::new(move |inv: CommandInvocation, hs: Handshake| {
                let toy = toy.clone();
                async move { toy.handle(inv, hs).await }.boxed()
            }),
        }
    }

    async fn handle(&self, inv: CommandInvocation, hs: Handshake) {
        let name = inv.command.slug.strip_prefix("points__").unwrap_or_default();
        match name {
            "points" => {
                let line = format!("{} has {} points", inv.message.author_name, inv.user.points);
                self.event_bus.publish(BusEvent::SystemMessage(line)).await;
                hs.accept();
            }
            "give" => match self.give(&inv).await {
                Ok(line) => {
                    self.event_bus.publish(BusEvent::SystemMessage(line)).await;
                    hs.accept();
                }
                Err(reason) => {
                    hs.reject(reason);
                }
            },
            other => debug!("PointsToy: no behaviour for '{}'", other),
        }
    }

    /// Moves points from the invoker to the target. The error string is
    /// shown to the invoker.
    async fn give(&self, inv: &CommandInvocation) -> Result<String, String> {
        if !self.settings.read(|s| s.enabled) {
            return Err("the points economy is switched off".to_string());
        }
        let target_name = inv
            .params
            .get("target")
            .and_then(|v| v.as_text())
            .unwrap_or_default()
            .to_string();
        let raw_amount = inv.params.get("amount").and_then(|v| v.as_number()).unwrap_or(f64::NAN);
        if !raw_amount.is_finite() || raw_amount.fract() != 0.0 || raw_amount < 1.0 {
            return Err("the amount must be a whole number above zero".to_string());
        }
        let amount = raw_amount as i64;

        let Some(target_id) = self.resolve_target(&target_name).await else {
            return Err(format!("nobody called {target_name} has chatted yet"));
        };
        if target_id == inv.message.author_id {
            return Err("you cannot give points to yourself".to_string());
        }
        // The dispatcher charges the command's own cost after we accept.
        if inv.user.points < amount + inv.command.effective_cost() {
            return Err(format!("you only have {} points", inv.user.points));
        }

        let debit = UserUpdate::points(-amount).with_display_name(&inv.message.author_name);
        if let Err(e) = self.ledger.update_user(&inv.message.author_id, &debit).await {
            error!("PointsToy: debit of {} failed => {:?}", inv.message.author_id, e);
            return Err("points could not be moved right now".to_string());
        }
        if let Err(e) = self.ledger.update_user(&target_id, &UserUpdate::points(amount)).await {
            error!("PointsToy: credit of {} failed, refunding => {:?}", target_id, e);
            let refund = UserUpdate::points(amount);
            if let Err(e) = self.ledger.update_user(&inv.message.author_id, &refund).await {
                error!("PointsToy: refund to {} failed => {:?}", inv.message.author_id, e);
            }
            return Err("points could not be moved right now".to_string());
        }

        info!("{} gave {} points to {}", inv.message.author_name, amount, target_name);
        Ok(format!("{} gave {} points to {}", inv.message.author_name, amount, target_name))
    }

    /// Chat first (most recent id under that name), then stored display
    /// names with and without the `@`.
    pub async fn resolve_target(&self, name: &str) -> Option<String> {
        if let Some(id) = self.authors.resolve(name) {
            return Some(id);
        }
        let bare = name.trim_start_matches('@');
        for candidate in [format!("@{bare}"), bare.to_string()] {
            match self.ledger.find_by_display_name(&candidate).await {
                Ok(users) => {
                    if let Some(u) = users.into_iter().next() {
                        return Some(u.id);
                    }
                }
                Err(e) => warn!("PointsToy: display name lookup failed => {:?}", e),
            }
        }
        None
    }

    /// Grants the chat reward if the economy is on and the author's reward
    /// cooldown has passed. Returns whether points were granted.
    pub async fn reward_chatter(&self, msg: &ChatMessage) -> bool {
        let settings = self.settings.get();
        if !settings.enabled || settings.chat_reward <= 0 {
            return false;
        }
        {
            let mut last = self.last_reward.lock();
            let now = Instant::now();
            let window = Duration::from_secs(settings.chat_reward_cooldown);
            if let Some(at) = last.get(&msg.author_id) {
                if now.saturating_duration_since(*at) < window {
                    return false;
                }
            }
            last.insert(msg.author_id.clone(), now);
        }

        let update = UserUpdate::points(settings.chat_reward)
            .with_display_name(&msg.author_name)
            .with_stream_id(msg.stream_id.as_deref());
        match self.ledger.update_user(&msg.author_id, &update).await {
            Ok(()) => true,
            Err(e) => {
                error!("PointsToy: chat reward for {} failed => {:?}", msg.author_id, e);
                false
            }
        }
    }

    /// Feeds chat lines from the bus into [`PointsToy::reward_chatter`]
    /// until the bus shuts down.
    pub fn spawn_chat_rewards(self: Arc<Self>, mut rx: mpsc::Receiver<BusEvent>) -> JoinHandle<()> {
        let mut shutdown_rx = self.event_bus.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    evt = rx.recv() => match evt {
                        Some(BusEvent::ChatMessage(msg)) => {
                            self.reward_chatter(&msg).await;
                        }
                        Some(_) => {}
                        None => break,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("PointsToy: chat reward task stopped");
        })
    }
}
