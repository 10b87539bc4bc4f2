// File: src/commands/dispatcher.rs
//
// Runs every chat line through lookup, validation and the handler
// handshake, and commits accepted commands to the ledger.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use toybox_common::models::{
    ChatMessage, CommandDefinition, DispatchEvent, ParamType, Params, User, UserUpdate,
};
use toybox_common::traits::PointsLedger;

use crate::commands::cooldown::CooldownTracker;
use crate::commands::grammar;
use crate::commands::handshake::{Handshake, HandshakeState};
use crate::commands::registry::CommandRegistry;
use crate::eventbus::{BusEvent, EventBus};
use crate::sync::SyncedValue;
use crate::toys::points::PointsSettings;
use crate::toys::ToyDescriptor;

/// Everything a handler gets to see about one invocation.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub command: CommandDefinition,
    pub message: ChatMessage,
    pub user: User,
    pub params: Params,
}

/// A toy's entry point. It must resolve the handshake before its future
/// completes; resolutions made later are not seen.
pub type CommandHandler =
    Arc<dyn Fn(CommandInvocation, Handshake) -> BoxFuture<'static, ()> + Send + Sync>;

/// Why a command did not go through. The `Display` text is what chat sees.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("you are banned from using commands")]
    Banned,

    #[error("!{command} is for channel members only")]
    MemberOnly { command: String },

    #[error("!{command} only works with a Super Chat")]
    SuperOnly { command: String },

    #[error("!{command} is on cooldown, try again in {remaining} seconds")]
    Cooldown { command: String, remaining: u64 },

    #[error("!{command} was just used, try again in {remaining} seconds")]
    GroupCooldown { command: String, remaining: u64 },

    #[error("!{command} costs {cost} points but you only have {points}")]
    InsufficientPoints { command: String, cost: i64, points: i64 },

    #[error("!{command} needs a value for '{name}'")]
    MissingParam { command: String, name: String },

    #[error("!{command} expects a number for '{name}'")]
    InvalidNumber { command: String, name: String },

    /// Reason given by the handler, passed through untouched.
    #[error("{0}")]
    Handler(String),
}

/// What happened to one chat line.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Not a command, unknown keyword, or a disabled command.
    Ignored,
    Accepted { slug: String },
    Rejected { slug: String, rejection: Rejection },
    /// No handler resolved the handshake.
    Unanswered { slug: String },
    /// A storage fault; nothing was committed.
    Dropped { slug: String },
}

impl DispatchOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DispatchOutcome::Accepted { .. })
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            DispatchOutcome::Rejected { rejection, .. } => Some(rejection),
            _ => None,
        }
    }
}

pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    ledger: Arc<dyn PointsLedger>,
    event_bus: Arc<EventBus>,
    cooldowns: CooldownTracker,
    handlers: RwLock<HashMap<String, Vec<CommandHandler>>>,
    points_settings: RwLock<Option<SyncedValue<PointsSettings>>>,
    /// Held for the whole pipeline of one message, so a cost check and the
    /// matching debit are never interleaved with another message.
    in_flight: AsyncMutex<()>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CommandRegistry>,
        ledger: Arc<dyn PointsLedger>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        debug!("Initializing Dispatcher");
        Self {
            registry,
            ledger,
            event_bus,
            cooldowns: CooldownTracker::new(),
            handlers: RwLock::new(HashMap::new()),
            points_settings: RwLock::new(None),
            in_flight: AsyncMutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<dyn PointsLedger> {
        &self.ledger
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn cooldowns(&self) -> &CooldownTracker {
        &self.cooldowns
    }

    /// Command costs are only charged while these settings say the points
    /// economy is on. Without settings, costs are never charged.
    pub fn set_points_settings(&self, settings: SyncedValue<PointsSettings>) {
        *self.points_settings.write() = Some(settings);
    }

    pub fn economy_enabled(&self) -> bool {
        self.points_settings
            .read()
            .as_ref()
            .map(|s| s.read(|p| p.enabled))
            .unwrap_or(false)
    }

    pub fn register_handler(&self, owner_slug: &str, handler: CommandHandler) {
        self.handlers
            .write()
            .entry(owner_slug.to_string())
            .or_default()
            .push(handler);
    }

    /// Seeds the toy's commands into the registry and routes its slugs to
    /// its handler. Returns the definitions in force.
    pub fn register_toy(&self, toy: ToyDescriptor) -> Vec<CommandDefinition> {
        info!("Registering toy '{}' ({})", toy.slug, toy.name);
        let effective = self.registry.reconcile(toy.commands, &toy.slug);
        self.register_handler(&toy.slug, toy.handler);
        effective
    }

    /// Handles one ingest batch in order. Every message is also announced on
    /// the bus for passive listeners.
    pub async fn on_chat_batch(&self, messages: &[ChatMessage]) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::with_capacity(messages.len());
        for msg in messages {
            self.event_bus.publish(BusEvent::ChatMessage(msg.clone())).await;
            outcomes.push(self.handle_message(msg).await);
        }
        outcomes
    }

    pub async fn handle_message(&self, msg: &ChatMessage) -> DispatchOutcome {
        let _guard = self.in_flight.lock().await;

        // 1) Only `!` lines are commands.
        let Some((keyword, remainder)) = grammar::split_command(&msg.text) else {
            return DispatchOutcome::Ignored;
        };

        // 2) Lookup. Unknown and disabled commands are chat noise.
        let Some(def) = self.registry.lookup(keyword) else {
            debug!("No command matches '!{}'", keyword);
            return DispatchOutcome::Ignored;
        };
        if !def.enabled {
            debug!("Command '{}' is disabled", def.slug);
            return DispatchOutcome::Ignored;
        }

        // 3) Arguments.
        let params = grammar::parse_remainder(remainder, &def.params);

        // 4) User, or a stand-in for someone we have never stored.
        let user = match self.ledger.get_user(&msg.author_id).await {
            Ok(Some(u)) => u,
            Ok(None) => User::placeholder(&msg.author_id, &msg.author_name),
            Err(e) => {
                error!("Dispatcher: could not load user '{}' => {:?}", msg.author_id, e);
                return DispatchOutcome::Dropped { slug: def.slug };
            }
        };

        // 5)-10) Validation.
        let economy = self.economy_enabled();
        if let Err(rejection) = self.validate(&def, msg, &user, &params, economy) {
            return self.reject(&def, msg, rejection).await;
        }

        // 11) Handshake with the owning toy.
        let invocation = CommandInvocation {
            command: def.clone(),
            message: msg.clone(),
            user: user.clone(),
            params: params.clone(),
        };
        let state = self.run_handlers(def.owner_slug(), invocation).await;

        match state {
            // 12) Commit.
            HandshakeState::Accepted => self.commit(def, msg, user, params, economy).await,
            // 13) The handler's own reason.
            HandshakeState::Rejected(reason) => {
                self.reject(&def, msg, Rejection::Handler(reason)).await
            }
            HandshakeState::Pending => {
                debug!("Nobody answered '{}' from '{}'", def.slug, msg.author_id);
                DispatchOutcome::Unanswered { slug: def.slug }
            }
        }
    }

    fn validate(
        &self,
        def: &CommandDefinition,
        msg: &ChatMessage,
        user: &User,
        params: &Params,
        economy: bool,
    ) -> Result<(), Rejection> {
        if user.banned {
            return Err(Rejection::Banned);
        }
        if def.member_only && !msg.is_member {
            return Err(Rejection::MemberOnly { command: def.command.clone() });
        }
        if def.super_only && !msg.is_super_chat {
            return Err(Rejection::SuperOnly { command: def.command.clone() });
        }
        if let Some(remaining) = self.cooldowns.user_remaining(&def.slug, &user.id, def.cool_down) {
            return Err(Rejection::Cooldown { command: def.command.clone(), remaining });
        }
        if let Some(remaining) = self.cooldowns.group_remaining(&def.slug, def.group_cool_down) {
            return Err(Rejection::GroupCooldown { command: def.command.clone(), remaining });
        }
        let cost = def.effective_cost();
        if economy && cost > 0 && user.points < cost {
            return Err(Rejection::InsufficientPoints {
                command: def.command.clone(),
                cost,
                points: user.points,
            });
        }
        for param in def.params.iter().filter(|p| !p.optional) {
            match params.get(&param.name) {
                None => {
                    return Err(Rejection::MissingParam {
                        command: def.command.clone(),
                        name: param.name.clone(),
                    });
                }
                Some(v) if v.is_blank() => {
                    return Err(Rejection::MissingParam {
                        command: def.command.clone(),
                        name: param.name.clone(),
                    });
                }
                Some(v) if param.kind == ParamType::Number && v.as_number().map_or(true, f64::is_nan) => {
                    return Err(Rejection::InvalidNumber {
                        command: def.command.clone(),
                        name: param.name.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Offers the invocation to each handler of `owner_slug` in turn until
    /// one resolves it.
    async fn run_handlers(&self, owner_slug: &str, invocation: CommandInvocation) -> HandshakeState {
        let handlers: Vec<CommandHandler> = self
            .handlers
            .read()
            .get(owner_slug)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            warn!("No handler registered for toy '{}'", owner_slug);
        }

        let handshake = Handshake::new();
        for handler in handlers {
            handler(invocation.clone(), handshake.clone()).await;
            if handshake.is_resolved() {
                break;
            }
        }
        handshake.state()
    }

    async fn commit(
        &self,
        def: CommandDefinition,
        msg: &ChatMessage,
        mut user: User,
        params: Params,
        economy: bool,
    ) -> DispatchOutcome {
        let cost = if economy { def.effective_cost() } else { 0 };
        let mut update = UserUpdate::default()
            .with_display_name(&msg.author_name)
            .with_stream_id(msg.stream_id.as_deref())
            .with_command(&def.slug);
        if cost > 0 {
            update.relative_points = Some(-cost);
        }

        if let Err(e) = self.ledger.update_user(&msg.author_id, &update).await {
            error!("Dispatcher: ledger update for '{}' failed => {:?}", def.slug, e);
            return DispatchOutcome::Dropped { slug: def.slug };
        }

        self.cooldowns.record(&def.slug, &user.id);

        user.display_name = msg.author_name.clone();
        user.points -= cost;
        user.points_spent += cost;

        info!("{} used !{} ({})", msg.author_name, def.command, def.slug);
        self.event_bus
            .publish_dispatch(DispatchEvent::Accepted {
                command_slug: def.slug.clone(),
                user_id: msg.author_id.clone(),
                message: msg.clone(),
                user,
                params,
            })
            .await;
        DispatchOutcome::Accepted { slug: def.slug }
    }

    async fn reject(&self, def: &CommandDefinition, msg: &ChatMessage, rejection: Rejection) -> DispatchOutcome {
        let reason = rejection.to_string();
        info!("{}: {} (!{})", msg.author_name, reason, def.command);
        self.event_bus
            .publish_dispatch(DispatchEvent::Rejected {
                command_slug: def.slug.clone(),
                user_id: msg.author_id.clone(),
                reason,
            })
            .await;
        DispatchOutcome::Rejected { slug: def.slug.clone(), rejection }
    }
}
