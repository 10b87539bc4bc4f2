use serde::{Deserialize, Serialize};

/// One chat line after normalization. Built once by the ingest layer and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Platform-unique id, also the dedup key.
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    /// Reassembled text. Custom emoji appear as their shortcode.
    pub text: String,
    /// Image urls of the custom emoji found in `text`, in order.
    #[serde(default)]
    pub emojis: Vec<String>,
    pub timestamp_micros: Option<i64>,
    pub is_member: bool,
    pub is_super_chat: bool,
    /// Display string of the paid amount, only for super chats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_amount: Option<String>,
    pub stream_id: Option<String>,
}

impl ChatMessage {
    /// Convenience constructor for a plain text line.
    pub fn text(id: &str, author_id: &str, author_name: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            author_id: author_id.to_string(),
            author_name: author_name.to_string(),
            text: text.to_string(),
            emojis: Vec::new(),
            timestamp_micros: None,
            is_member: false,
            is_super_chat: false,
            paid_amount: None,
            stream_id: None,
        }
    }

    pub fn is_command_candidate(&self) -> bool {
        self.text.starts_with('!')
    }
}
