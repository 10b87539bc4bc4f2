// File: src/chat/ingest.rs
//
// Turns live-chat responses into `ChatMessage`s. Only a small part of the
// platform's response shape is relied upon; anything unexpected is skipped
// one action at a time.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use toybox_common::models::ChatMessage;

use crate::chat::author_index::AuthorIndex;
use crate::chat::dedup::{DedupWindow, DEFAULT_DEDUP_WINDOW};

const ACTION_PATHS: [&str; 2] = [
    "/continuationContents/liveChatContinuation/actions",
    "/contents/liveChatRenderer/actions",
];

const TEXT_RENDERER: &str = "liveChatTextMessageRenderer";
const PAID_RENDERER: &str = "liveChatPaidMessageRenderer";

pub struct ChatIngest {
    dedup: DedupWindow,
    authors: Arc<AuthorIndex>,
    /// Used when the payload itself does not say which stream it belongs to.
    default_stream_id: Option<String>,
}

impl ChatIngest {
    pub fn new(authors: Arc<AuthorIndex>) -> Self {
        Self::with_window(authors, DEFAULT_DEDUP_WINDOW)
    }

    pub fn with_window(authors: Arc<AuthorIndex>, window: usize) -> Self {
        Self {
            dedup: DedupWindow::new(window),
            authors,
            default_stream_id: None,
        }
    }

    pub fn authors(&self) -> &Arc<AuthorIndex> {
        &self.authors
    }

    pub fn set_default_stream_id(&mut self, stream_id: Option<String>) {
        self.default_stream_id = stream_id;
    }

    /// Parses one raw response body. Bad JSON yields no messages.
    pub fn handle_raw_str(&mut self, raw: &str) -> Vec<ChatMessage> {
        match serde_json::from_str::<Value>(raw) {
            Ok(payload) => self.handle_raw_payload(&payload),
            Err(e) => {
                warn!("ChatIngest: payload is not JSON => {}", e);
                Vec::new()
            }
        }
    }

    /// Extracts new messages from one response, in the order they appear.
    pub fn handle_raw_payload(&mut self, payload: &Value) -> Vec<ChatMessage> {
        let Some(actions) = ACTION_PATHS
            .iter()
            .find_map(|p| payload.pointer(p))
            .and_then(Value::as_array)
        else {
            debug!("ChatIngest: payload has no action list");
            return Vec::new();
        };

        let stream_id = extract_stream_id(payload).or_else(|| self.default_stream_id.clone());

        let mut out = Vec::new();
        for (i, action) in actions.iter().enumerate() {
            let Some(item) = action.pointer("/addChatItemAction/item") else {
                continue;
            };
            let (renderer, is_super_chat) = if let Some(r) = item.get(TEXT_RENDERER) {
                (r, false)
            } else if let Some(r) = item.get(PAID_RENDERER) {
                (r, true)
            } else {
                continue;
            };

            let Some(message) = parse_renderer(renderer, is_super_chat, stream_id.as_deref()) else {
                warn!("ChatIngest: skipping malformed action #{}", i);
                continue;
            };
            if !self.dedup.insert(&message.id) {
                debug!("ChatIngest: duplicate message id {}", message.id);
                continue;
            }
            self.authors.record(&message.author_id, &message.author_name);
            out.push(message);
        }
        out
    }
}

fn parse_renderer(renderer: &Value, is_super_chat: bool, stream_id: Option<&str>) -> Option<ChatMessage> {
    let id = renderer.get("id")?.as_str()?.to_string();
    let author_id = renderer.get("authorExternalChannelId")?.as_str()?.to_string();
    let author_name = renderer
        .pointer("/authorName/simpleText")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| author_id.clone());
    let timestamp_micros = renderer
        .get("timestampUsec")
        .and_then(|v| v.as_str().and_then(|s| s.parse::<i64>().ok()).or_else(|| v.as_i64()));

    let (text, emojis) = renderer
        .pointer("/message/runs")
        .and_then(Value::as_array)
        .map(|runs| assemble_runs(runs))
        .unwrap_or_default();

    let paid_amount = if is_super_chat {
        renderer
            .pointer("/purchaseAmountText/simpleText")
            .and_then(Value::as_str)
            .map(str::to_string)
    } else {
        None
    };

    Some(ChatMessage {
        id,
        author_id,
        author_name,
        text,
        emojis,
        timestamp_micros,
        is_member: has_member_badge(renderer),
        is_super_chat,
        paid_amount,
        stream_id: stream_id.map(str::to_string),
    })
}

/// Joins text and emoji runs into one string. Custom emoji become their
/// shortcode and their image url is collected; standard emoji are inlined
/// as the emoji itself.
fn assemble_runs(runs: &[Value]) -> (String, Vec<String>) {
    let mut text = String::new();
    let mut emojis = Vec::new();
    for run in runs {
        if let Some(t) = run.get("text").and_then(Value::as_str) {
            text.push_str(t);
            continue;
        }
        let Some(emoji) = run.get("emoji") else {
            continue;
        };
        let is_custom = emoji
            .get("isCustomEmoji")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let emoji_id = emoji.get("emojiId").and_then(Value::as_str).unwrap_or("");
        if is_custom {
            let shortcut = emoji
                .pointer("/shortcuts/0")
                .and_then(Value::as_str)
                .unwrap_or(emoji_id);
            text.push_str(shortcut);
            if let Some(url) = emoji.pointer("/image/thumbnails/0/url").and_then(Value::as_str) {
                emojis.push(url.to_string());
            }
        } else {
            text.push_str(emoji_id);
        }
    }
    (text, emojis)
}

/// Members carry a badge with a custom thumbnail; moderators and verified
/// badges use a built-in icon instead.
fn has_member_badge(renderer: &Value) -> bool {
    renderer
        .get("authorBadges")
        .and_then(Value::as_array)
        .map(|badges| {
            badges.iter().any(|b| {
                b.pointer("/liveChatAuthorBadgeRenderer/customThumbnail").is_some()
                    || b.get("customThumbnail").is_some()
            })
        })
        .unwrap_or(false)
}

/// The invalidation topic looks like `chat~<videoId>~...`.
fn extract_stream_id(payload: &Value) -> Option<String> {
    let topic = payload
        .pointer("/continuationContents/liveChatContinuation/continuations/0/invalidationContinuationData/invalidationId/topic")
        .and_then(Value::as_str)?;
    topic
        .split('~')
        .nth(1)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
