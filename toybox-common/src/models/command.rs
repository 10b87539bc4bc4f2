use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Separator between the owning toy's slug and the command name.
pub const SLUG_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Username,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandParam {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    #[serde(default)]
    pub optional: bool,
    /// Per-param settings this version does not know about.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandParam {
    pub fn required(name: &str, kind: ParamType) -> Self {
        Self { name: name.to_string(), kind, optional: false, extra: Map::new() }
    }

    pub fn optional(name: &str, kind: ParamType) -> Self {
        Self { name: name.to_string(), kind, optional: true, extra: Map::new() }
    }
}

/// A chat command as stored in the shared registry table.
///
/// `slug` never changes once created; `command` is the keyword chat types
/// after `!` and may be edited by the streamer at any time. Fields this
/// version does not know about are kept in `extra` so older builds never
/// strip settings written by newer ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDefinition {
    pub command: String,
    pub slug: String,
    #[serde(default)]
    pub params: Vec<CommandParam>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub member_only: bool,
    #[serde(default)]
    pub super_only: bool,
    #[serde(default)]
    pub cost_enabled: bool,
    #[serde(default)]
    pub cost: u32,
    /// Per-user cooldown in seconds.
    #[serde(default)]
    pub cool_down: u32,
    /// Cooldown in seconds shared by every user.
    #[serde(default)]
    pub group_cool_down: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

impl CommandDefinition {
    /// New enabled definition whose keyword equals `name`.
    pub fn new(owner_slug: &str, name: &str) -> Self {
        Self {
            command: name.to_string(),
            slug: format!("{owner_slug}{SLUG_SEPARATOR}{name}"),
            params: Vec::new(),
            enabled: true,
            member_only: false,
            super_only: false,
            cost_enabled: false,
            cost: 0,
            cool_down: 0,
            group_cool_down: 0,
            extra: Map::new(),
        }
    }

    pub fn with_param(mut self, param: CommandParam) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost_enabled = true;
        self.cost = cost;
        self
    }

    pub fn with_cooldown(mut self, seconds: u32) -> Self {
        self.cool_down = seconds;
        self
    }

    pub fn with_group_cooldown(mut self, seconds: u32) -> Self {
        self.group_cool_down = seconds;
        self
    }

    pub fn members_only(mut self) -> Self {
        self.member_only = true;
        self
    }

    pub fn super_chat_only(mut self) -> Self {
        self.super_only = true;
        self
    }

    /// The toy that owns this command: everything before the first `__`.
    pub fn owner_slug(&self) -> &str {
        self.slug
            .split_once(SLUG_SEPARATOR)
            .map(|(owner, _)| owner)
            .unwrap_or(&self.slug)
    }

    /// Cost actually charged, zero when charging is switched off.
    pub fn effective_cost(&self) -> i64 {
        if self.cost_enabled { i64::from(self.cost) } else { 0 }
    }
}

/// A coerced command argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            ParamValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            ParamValue::Number(_) => None,
        }
    }

    /// Empty or whitespace-only text counts as "not provided"; numbers
    /// never do.
    pub fn is_blank(&self) -> bool {
        matches!(self, ParamValue::Text(s) if s.trim().is_empty())
    }
}

/// Arguments keyed by parameter name.
pub type Params = BTreeMap<String, ParamValue>;
