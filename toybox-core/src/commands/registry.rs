// File: src/commands/registry.rs

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use toybox_common::models::{CommandDefinition, CommandParam};
use toybox_common::traits::SyncChannel;

use crate::sync::{ListenerId, SyncedValue};
use crate::Error;

/// Shared key the command table lives under.
pub const COMMANDS_KEY: &str = "commands";

pub type CommandTable = BTreeMap<String, CommandDefinition>;

/// keyword -> slug, plus the order slugs were registered in.
#[derive(Default)]
struct KeywordIndex {
    by_keyword: HashMap<String, String>,
    registration_order: Vec<String>,
}

impl KeywordIndex {
    /// Slugs registered later overwrite earlier ones on a keyword clash.
    /// Slugs nobody registered in this process (added by another surface)
    /// go first, in slug order.
    fn rebuild(&mut self, table: &CommandTable) {
        let mut by_keyword = HashMap::with_capacity(table.len());
        let unregistered = table
            .keys()
            .filter(|slug| !self.registration_order.contains(slug));
        let registered = self
            .registration_order
            .iter()
            .filter(|slug| table.contains_key(*slug));
        for slug in unregistered.chain(registered) {
            if let Some(def) = table.get(slug) {
                if let Some(previous) = by_keyword.insert(def.command.clone(), slug.clone()) {
                    if previous != *slug {
                        warn!(
                            "Keyword '{}' is used by both '{}' and '{}'; '{}' wins",
                            def.command, previous, slug, slug
                        );
                    }
                }
            }
        }
        self.by_keyword = by_keyword;
    }
}

/// The live table of every command, keyed by slug and shared through a
/// [`SyncedValue`] so edits from any surface show up everywhere.
pub struct CommandRegistry {
    table: SyncedValue<CommandTable>,
    index: Arc<RwLock<KeywordIndex>>,
    listener: Mutex<Option<ListenerId>>,
}

impl CommandRegistry {
    pub fn new(channel: Arc<dyn SyncChannel>) -> Self {
        let table = SyncedValue::new(channel, COMMANDS_KEY, CommandTable::new());
        let index = Arc::new(RwLock::new(KeywordIndex::default()));
        table.read(|t| index.write().rebuild(t));

        let index_for_listener = index.clone();
        let listener = table.on_change(move |t: &CommandTable| {
            debug!("Command table changed remotely; rebuilding keyword index");
            index_for_listener.write().rebuild(t);
        });

        Self { table, index, listener: Mutex::new(Some(listener)) }
    }

    /// Seeds `defaults` for the toy `owner_slug` and returns the definitions
    /// actually in force. A slug already present keeps its stored (possibly
    /// edited) definition.
    pub fn reconcile(&self, defaults: Vec<CommandDefinition>, owner_slug: &str) -> Vec<CommandDefinition> {
        let mut effective = Vec::with_capacity(defaults.len());
        let mut missing = Vec::new();

        self.table.read(|table| {
            for def in defaults {
                if def.owner_slug() != owner_slug {
                    warn!(
                        "Toy '{}' tried to register '{}' which it does not own; skipping",
                        owner_slug, def.slug
                    );
                    continue;
                }
                match table.get(&def.slug) {
                    Some(existing) => {
                        if !same_shape(&existing.params, &def.params) {
                            warn!(
                                "Command '{}' is stored with a different parameter list; keeping the stored one",
                                def.slug
                            );
                        }
                        effective.push(existing.clone());
                    }
                    None => {
                        missing.push(def.clone());
                        effective.push(def);
                    }
                }
            }
        });

        // Only write when something is new, so a restart never republishes
        // a table over edits made elsewhere.
        let seeded = missing.len();
        if seeded > 0 {
            self.table.update(|table| {
                for def in missing {
                    table.entry(def.slug.clone()).or_insert(def);
                }
            });
        }

        let registered: Vec<String> = effective.iter().map(|d| d.slug.clone()).collect();
        {
            let mut index = self.index.write();
            for slug in registered {
                index.registration_order.retain(|s| *s != slug);
                index.registration_order.push(slug);
            }
        }
        self.rebuild_index();

        info!(
            "Registered {} command(s) for '{}' ({} new)",
            effective.len(),
            owner_slug,
            seeded
        );
        effective
    }

    /// Exact, case-sensitive match on the current keyword.
    pub fn lookup(&self, keyword: &str) -> Option<CommandDefinition> {
        let slug = self.index.read().by_keyword.get(keyword).cloned()?;
        self.table.read(|t| t.get(&slug).cloned())
    }

    pub fn get(&self, slug: &str) -> Option<CommandDefinition> {
        self.table.read(|t| t.get(slug).cloned())
    }

    /// Edits one definition. The slug cannot be changed, and an edit that
    /// would give the command a keyword another command already answers to
    /// is refused with [`Error::Conflict`].
    pub fn update(
        &self,
        slug: &str,
        edit: impl FnOnce(&mut CommandDefinition),
    ) -> Result<CommandDefinition, Error> {
        let mut candidate = self
            .get(slug)
            .ok_or_else(|| Error::NotFound(format!("command '{slug}'")))?;
        edit(&mut candidate);
        candidate.slug = slug.to_string();

        let clash = self.table.read(|t| {
            t.values()
                .find(|d| d.slug != slug && d.command == candidate.command)
                .map(|d| d.slug.clone())
        });
        if let Some(other) = clash {
            return Err(Error::Conflict(format!(
                "keyword '{}' is already used by '{}'",
                candidate.command, other
            )));
        }

        let stored = candidate.clone();
        self.table.update(move |t| {
            t.insert(stored.slug.clone(), stored);
        });
        self.rebuild_index();
        Ok(candidate)
    }

    pub fn set_enabled(&self, slug: &str, enabled: bool) -> Result<CommandDefinition, Error> {
        self.update(slug, |d| d.enabled = enabled)
    }

    /// Removes a command outright. Only used when a toy is uninstalled.
    pub fn remove(&self, slug: &str) -> Option<CommandDefinition> {
        let removed = self.table.update(|t| t.remove(slug));
        if removed.is_some() {
            self.index.write().registration_order.retain(|s| s != slug);
            self.rebuild_index();
        }
        removed
    }

    pub fn snapshot(&self) -> CommandTable {
        self.table.get()
    }

    pub fn commands_for(&self, owner_slug: &str) -> Vec<CommandDefinition> {
        self.table.read(|t| {
            t.values()
                .filter(|d| d.owner_slug() == owner_slug)
                .cloned()
                .collect()
        })
    }

    /// The table as JSON, `slug -> definition`.
    pub fn export_json(&self) -> Result<String, Error> {
        Ok(self.table.read(|t| serde_json::to_string_pretty(t))?)
    }

    /// Replaces the whole table with `json`. Unknown fields are preserved.
    pub fn import_json(&self, json: &str) -> Result<usize, Error> {
        let incoming: CommandTable = serde_json::from_str(json)?;
        for (slug, def) in &incoming {
            if *slug != def.slug {
                return Err(Error::Parse(format!(
                    "entry '{}' carries slug '{}'",
                    slug, def.slug
                )));
            }
        }
        let count = incoming.len();
        self.table.set(incoming);
        self.rebuild_index();
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.table.read(|t| t.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops following remote edits and releases the channel subscription.
    pub fn dispose(&self) {
        if let Some(id) = self.listener.lock().take() {
            self.table.remove_listener(id);
        }
        self.table.dispose();
    }

    fn rebuild_index(&self) {
        let mut index = self.index.write();
        self.table.read(|t| index.rebuild(t));
    }
}

/// Same names, types and optionality in the same order. Extra settings on
/// a param do not count.
fn same_shape(a: &[CommandParam], b: &[CommandParam]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x.name == y.name && x.kind == y.kind && x.optional == y.optional)
}
