pub mod cooldown;
pub mod dispatcher;
pub mod grammar;
pub mod handshake;
pub mod registry;

pub use cooldown::CooldownTracker;
pub use dispatcher::{CommandHandler, CommandInvocation, DispatchOutcome, Dispatcher, Rejection};
pub use handshake::{Handshake, HandshakeState};
pub use registry::CommandRegistry;
