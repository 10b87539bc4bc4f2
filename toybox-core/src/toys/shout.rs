// File: src/toys/shout.rs

use std::sync::Arc;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use toybox_common::models::{CommandDefinition, CommandParam, ParamType};
use toybox_common::traits::SyncChannel;

use crate::commands::{CommandInvocation, Handshake};
use crate::sync::SyncedValue;
use crate::toys::ToyDescriptor;
use crate::utils::time::current_millis;

pub const SHOUT_KEY: &str = "toy:shout";
pub const MAX_SHOUT_CHARS: usize = 200;

/// The latest shout, as rendered by the overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shout {
    pub author_id: String,
    pub author_name: String,
    pub message: String,
    pub at_millis: i64,
}

pub struct ShoutToy {
    current: SyncedValue<Option<Shout>>,
}

impl ShoutToy {
    pub const SLUG: &'static str = "shout";

    pub fn new(channel: Arc<dyn SyncChannel>) -> Self {
        Self { current: SyncedValue::new(channel, SHOUT_KEY, None) }
    }

    pub fn default_commands() -> Vec<CommandDefinition> {
        vec![CommandDefinition::new(Self::SLUG, "shout")
            .with_param(CommandParam::required("message", ParamType::String))
            .with_cost(100)
            .with_group_cooldown(15)]
    }

    pub fn descriptor(self: &Arc<Self>) -> ToyDescriptor {
        let toy = self.clone();
        ToyDescriptor {
            slug: Self::SLUG.to_string(),
            name: "Shout".to_string(),
            commands: Self::default_commands(),
            handler: Arc::new(move |inv: CommandInvocation, hs: Handshake| {
                let toy = toy.clone();
                async move { toy.handle(inv, hs) }.boxed()
            }),
        }
    }

    pub fn last_shout(&self) -> Option<Shout> {
        self.current.get()
    }

    fn handle(&self, inv: CommandInvocation, hs: Handshake) {
        let message = inv
            .params
            .get("message")
            .and_then(|v| v.as_text())
            .unwrap_or_default()
            .trim()
            .to_string();
        if message.is_empty() {
            hs.reject("there is nothing to shout");
            return;
        }
        if message.chars().count() > MAX_SHOUT_CHARS {
            hs.reject(format!("shouts are limited to {MAX_SHOUT_CHARS} characters"));
            return;
        }
        if !hs.accept() {
            return;
        }
        info!("{} shouts: {}", inv.message.author_name, message);
        self.current.set(Some(Shout {
            author_id: inv.message.author_id,
            author_name: inv.message.author_name,
            message,
            at_millis: current_millis(),
        }));
    }
}
