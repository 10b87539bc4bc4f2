//! Frames exchanged between a `RelayChannel` and a `RelayHub`, one JSON
//! object per WebSocket text message.

use serde::{Deserialize, Serialize};

use toybox_common::traits::StampedValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelayFrame {
    /// client -> hub: start receiving updates for `key`; the hub always
    /// answers with a `Snapshot`.
    Subscribe { key: String },
    /// client -> hub
    Unsubscribe { key: String },
    /// client -> hub: a local write.
    Publish { update: StampedValue },
    /// hub -> client
    Update { update: StampedValue },
    /// hub -> client: reply to `Subscribe`. `update` is `None` when the hub
    /// has never seen the key.
    Snapshot {
        key: String,
        #[serde(default)]
        update: Option<StampedValue>,
    },
}

impl RelayFrame {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
