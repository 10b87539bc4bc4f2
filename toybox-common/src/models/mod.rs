// File: toybox-common/src/models/mod.rs
pub mod chat;
pub mod command;
pub mod event;
pub mod user;

pub use chat::ChatMessage;
pub use command::{CommandDefinition, CommandParam, ParamType, ParamValue, Params};
pub use event::DispatchEvent;
pub use user::{User, UserUpdate};
