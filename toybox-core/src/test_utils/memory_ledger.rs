// File: toybox-core/src/test_utils/memory_ledger.rs

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use toybox_common::models::{User, UserUpdate};
use toybox_common::traits::PointsLedger;

use crate::Error;

/// `PointsLedger` kept in a map. Every update happens under one lock, which
/// is all the atomicity the trait asks for.
#[derive(Default)]
pub struct MemoryLedger {
    users: Mutex<HashMap<String, User>>,
    usage: Mutex<HashMap<(String, String), i64>>,
    streams: Mutex<HashMap<String, String>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a user row as-is.
    pub fn insert(&self, user: User) {
        self.users.lock().insert(user.id.clone(), user);
    }

    pub fn usage_count(&self, user_id: &str, slug: &str) -> i64 {
        self.usage
            .lock()
            .get(&(user_id.to_string(), slug.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn last_stream(&self, user_id: &str) -> Option<String> {
        self.streams.lock().get(user_id).cloned()
    }

    pub fn total_points(&self) -> i64 {
        self.users.lock().values().map(|u| u.points).sum()
    }
}

#[async_trait]
impl PointsLedger for MemoryLedger {
    async fn get_user(&self, id: &str) -> Result<Option<User>, Error> {
        Ok(self.users.lock().get(id).cloned())
    }

    async fn update_user(&self, id: &str, update: &UserUpdate) -> Result<(), Error> {
        let mut users = self.users.lock();
        let name = update.display_name.as_deref().unwrap_or(id);
        let user = users
            .entry(id.to_string())
            .or_insert_with(|| User::placeholder(id, name));
        if let Some(n) = &update.display_name {
            user.display_name = n.clone();
        }
        if let Some(delta) = update.relative_points {
            user.points += delta;
            user.points_spent += update.spent();
        }
        user.last_seen = Utc::now();
        drop(users);

        if let Some(slug) = &update.command {
            *self
                .usage
                .lock()
                .entry((id.to_string(), slug.clone()))
                .or_insert(0) += 1;
        }
        if let Some(stream) = &update.stream_id {
            self.streams.lock().insert(id.to_string(), stream.clone());
        }
        Ok(())
    }

    async fn ban(&self, id: &str) -> Result<(), Error> {
        self.set_banned(id, true)
    }

    async fn unban(&self, id: &str) -> Result<(), Error> {
        self.set_banned(id, false)
    }

    async fn find_by_display_name(&self, name: &str) -> Result<Vec<User>, Error> {
        Ok(self
            .users
            .lock()
            .values()
            .filter(|u| u.display_name == name)
            .cloned()
            .collect())
    }

    async fn top_users(&self, limit: i64) -> Result<Vec<User>, Error> {
        let mut all: Vec<User> = self.users.lock().values().cloned().collect();
        all.sort_by(|a, b| b.points.cmp(&a.points).then_with(|| a.id.cmp(&b.id)));
        all.truncate(limit.max(0) as usize);
        Ok(all)
    }
}

impl MemoryLedger {
    fn set_banned(&self, id: &str, banned: bool) -> Result<(), Error> {
        let mut users = self.users.lock();
        let user = users
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("user '{id}'")))?;
        user.banned = banned;
        Ok(())
    }
}
