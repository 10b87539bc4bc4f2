// File: src/toys/mod.rs
//
// Built-in feature modules. A toy is plain data plus one handler function;
// the dispatcher wires it in with `Dispatcher::register_toy`.

pub mod gamba;
pub mod points;
pub mod shout;

use toybox_common::models::CommandDefinition;

use crate::commands::CommandHandler;

pub use gamba::{GambaAction, GambaRequest, GambaSettings, GambaToy, Payout};
pub use points::{PointsSettings, PointsToy};
pub use shout::{Shout, ShoutToy};

#[derive(Clone)]
pub struct ToyDescriptor {
    /// Owner prefix of every command slug this toy registers.
    pub slug: String,
    pub name: String,
    /// Defaults, seeded into the registry only when absent.
    pub commands: Vec<CommandDefinition>,
    pub handler: CommandHandler,
}

impl std::fmt::Debug for ToyDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToyDescriptor")
            .field("slug", &self.slug)
            .field("name", &self.name)
            .field("commands", &self.commands.len())
            .finish()
    }
}
