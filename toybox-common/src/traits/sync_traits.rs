use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A value as it travels over a sync channel: the payload plus the
/// wall-clock millisecond stamp of the write and the id of the writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedValue {
    pub key: String,
    pub value: Value,
    pub timestamp: i64,
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Update(StampedValue),
    /// The channel came back after a disconnect; holders should republish.
    Reconnected,
}

pub type SubscriptionId = u64;
pub type ChannelCallback = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Keyed publish/subscribe store shared between processes.
///
/// Delivery is best effort while connected. Ordering between updates is not
/// guaranteed; receivers arbitrate with the timestamp.
pub trait SyncChannel: Send + Sync {
    /// Never blocks and never fails from the caller's point of view.
    fn publish(&self, update: StampedValue);

    fn subscribe(&self, key: &str, callback: ChannelCallback) -> SubscriptionId;

    /// Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Newest value the channel has seen for `key`.
    fn get_current(&self, key: &str) -> Option<StampedValue>;
}
