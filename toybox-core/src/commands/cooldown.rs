// File: src/commands/cooldown.rs

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Last successful run per `slug:userId` and per `slug`.
///
/// Uses the tokio clock so tests can drive it with `tokio::time::advance`.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    per_user: Mutex<HashMap<String, Instant>>,
    per_command: Mutex<HashMap<String, Instant>>,
}

fn user_key(slug: &str, user_id: &str) -> String {
    format!("{slug}:{user_id}")
}

/// Whole seconds left, rounded up. `None` once the window has passed.
fn remaining(last: Option<&Instant>, window_secs: u32, now: Instant) -> Option<u64> {
    if window_secs == 0 {
        return None;
    }
    let last = last?;
    let window = Duration::from_secs(u64::from(window_secs));
    let elapsed = now.saturating_duration_since(*last);
    if elapsed >= window {
        return None;
    }
    let left = window - elapsed;
    let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
    Some(secs)
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_remaining(&self, slug: &str, user_id: &str, window_secs: u32) -> Option<u64> {
        let map = self.per_user.lock();
        remaining(map.get(&user_key(slug, user_id)), window_secs, Instant::now())
    }

    pub fn group_remaining(&self, slug: &str, window_secs: u32) -> Option<u64> {
        let map = self.per_command.lock();
        remaining(map.get(slug), window_secs, Instant::now())
    }

    /// Stamps both timers for an accepted run.
    pub fn record(&self, slug: &str, user_id: &str) {
        let now = Instant::now();
        self.per_user.lock().insert(user_key(slug, user_id), now);
        self.per_command.lock().insert(slug.to_string(), now);
    }

    pub fn clear(&self) {
        self.per_user.lock().clear();
        self.per_command.lock().clear();
    }
}
