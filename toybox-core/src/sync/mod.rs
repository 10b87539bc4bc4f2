//! src/sync/mod.rs
//!
//! Last-write-wins values shared between processes. A `SyncedValue` is the
//! process-local handle; a `SyncChannel` moves stamped writes between
//! handles, either inside one process (`LocalChannel`) or across processes
//! through a WebSocket relay (`RelayChannel` talking to a `RelayHub`).

pub mod local;
pub mod protocol;
pub mod relay;
pub mod relay_hub;
pub mod synced_value;

pub use local::LocalChannel;
pub use relay::RelayChannel;
pub use relay_hub::RelayHub;
pub use synced_value::{ListenerId, SyncedValue};
