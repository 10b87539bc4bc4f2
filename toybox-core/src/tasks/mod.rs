pub mod chat_poller;

pub use chat_poller::{spawn_chat_poller, PollerConfig};
