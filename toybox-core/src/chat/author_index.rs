// File: src/chat/author_index.rs

use std::collections::HashSet;

use dashmap::DashMap;

/// Which author ids have used which display names, and the other way round.
///
/// Names change and get reused, so both directions are many-to-many. The
/// index also remembers the id most recently seen under each name, which is
/// what a `@name` argument resolves to.
#[derive(Debug, Default)]
pub struct AuthorIndex {
    ids_by_name: DashMap<String, HashSet<String>>,
    names_by_id: DashMap<String, HashSet<String>>,
    latest_id_by_name: DashMap<String, String>,
    latest_name_by_id: DashMap<String, String>,
}

/// Lookups ignore case and a single leading `@`.
pub fn normalize_name(name: &str) -> String {
    let trimmed = name.trim();
    trimmed.strip_prefix('@').unwrap_or(trimmed).to_lowercase()
}

impl AuthorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, author_id: &str, author_name: &str) {
        if author_id.is_empty() || author_name.is_empty() {
            return;
        }
        let key = normalize_name(author_name);
        self.ids_by_name
            .entry(key.clone())
            .or_default()
            .insert(author_id.to_string());
        self.names_by_id
            .entry(author_id.to_string())
            .or_default()
            .insert(author_name.to_string());
        self.latest_id_by_name.insert(key, author_id.to_string());
        self.latest_name_by_id
            .insert(author_id.to_string(), author_name.to_string());
    }

    /// Most recent author id seen under `name`.
    pub fn resolve(&self, name: &str) -> Option<String> {
        self.latest_id_by_name
            .get(&normalize_name(name))
            .map(|id| id.value().clone())
    }

    pub fn ids_for_name(&self, name: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .ids_by_name
            .get(&normalize_name(name))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn names_for_id(&self, author_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .names_by_id
            .get(author_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn latest_name(&self, author_id: &str) -> Option<String> {
        self.latest_name_by_id
            .get(author_id)
            .map(|name| name.value().clone())
    }

    pub fn author_count(&self) -> usize {
        self.names_by_id.len()
    }
}
