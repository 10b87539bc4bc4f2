use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chatter as known to the points ledger.
///
/// `points` is allowed to go negative at the storage level; spending checks
/// happen before a debit is issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub points: i64,
    pub points_spent: i64,
    pub banned: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl User {
    /// Zero-point, unbanned stand-in for a chatter with no row yet.
    pub fn placeholder(id: &str, display_name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            points: 0,
            points_spent: 0,
            banned: false,
            first_seen: now,
            last_seen: now,
        }
    }
}

/// A relative change to one user. Every field is optional; `None` leaves the
/// stored value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserUpdate {
    pub display_name: Option<String>,
    pub stream_id: Option<String>,
    /// Slug of a command to count one use of.
    pub command: Option<String>,
    /// Added to `points`. Negative deltas also grow `points_spent`.
    pub relative_points: Option<i64>,
}

impl UserUpdate {
    pub fn points(delta: i64) -> Self {
        Self { relative_points: Some(delta), ..Default::default() }
    }

    pub fn with_display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    pub fn with_stream_id(mut self, stream_id: Option<&str>) -> Self {
        self.stream_id = stream_id.map(str::to_string);
        self
    }

    pub fn with_command(mut self, slug: &str) -> Self {
        self.command = Some(slug.to_string());
        self
    }

    /// Amount to add to `points_spent` for this update.
    pub fn spent(&self) -> i64 {
        match self.relative_points {
            Some(delta) if delta < 0 => -delta,
            _ => 0,
        }
    }
}
