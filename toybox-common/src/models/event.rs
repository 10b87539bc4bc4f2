use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, Params, User};

/// Outcome of one dispatched command, as seen by logs and UI surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum DispatchEvent {
    Accepted {
        command_slug: String,
        user_id: String,
        message: ChatMessage,
        user: User,
        params: Params,
    },
    Rejected {
        command_slug: String,
        user_id: String,
        reason: String,
    },
}

impl DispatchEvent {
    pub fn command_slug(&self) -> &str {
        match self {
            DispatchEvent::Accepted { command_slug, .. } => command_slug,
            DispatchEvent::Rejected { command_slug, .. } => command_slug,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            DispatchEvent::Accepted { user_id, .. } => user_id,
            DispatchEvent::Rejected { user_id, .. } => user_id,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            DispatchEvent::Rejected { reason, .. } => Some(reason),
            DispatchEvent::Accepted { .. } => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, DispatchEvent::Accepted { .. })
    }
}
