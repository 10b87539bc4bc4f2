// File: src/chat/dedup.rs

use std::collections::{HashSet, VecDeque};

/// How many message ids we remember by default.
pub const DEFAULT_DEDUP_WINDOW: usize = 1000;

/// Bounded set of recently seen ids. Once full, the oldest id is forgotten
/// first.
#[derive(Debug)]
pub struct DedupWindow {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(4096)),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns true the first time `id` is seen inside the window.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
