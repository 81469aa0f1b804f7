//! Lifecycle hooks and named actions.
//!
//! Hooks are matched by event and object patterns compiled once at
//! registration. A pattern is `*`, an exact name, `prefix*` or `*suffix`.

mod actions;
mod registry;

use std::fmt;
use std::str::FromStr;

use metaql_proto::{Record, UnifiedQuery, Value};
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::driver::TransactionHandle;

pub use actions::{ActionContext, ActionHandler, ActionRegistry};
pub use registry::{HookHandler, HookRegistry};

/// Lifecycle points at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookEvent {
    BeforeFind,
    AfterFind,
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
}

impl HookEvent {
    pub const ALL: [HookEvent; 8] = [
        HookEvent::BeforeFind,
        HookEvent::AfterFind,
        HookEvent::BeforeCreate,
        HookEvent::AfterCreate,
        HookEvent::BeforeUpdate,
        HookEvent::AfterUpdate,
        HookEvent::BeforeDelete,
        HookEvent::AfterDelete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeFind => "beforeFind",
            HookEvent::AfterFind => "afterFind",
            HookEvent::BeforeCreate => "beforeCreate",
            HookEvent::AfterCreate => "afterCreate",
            HookEvent::BeforeUpdate => "beforeUpdate",
            HookEvent::AfterUpdate => "afterUpdate",
            HookEvent::BeforeDelete => "beforeDelete",
            HookEvent::AfterDelete => "afterDelete",
        }
    }

    pub fn is_before(&self) -> bool {
        self.as_str().starts_with("before")
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookEvent::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown hook event '{s}'"))
    }
}

/// Compiled wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Any,
    Exact(String),
    Prefix(String),
    Suffix(String),
}

impl Pattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern.is_empty() || pattern == "*" {
            Pattern::Any
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            Pattern::Prefix(prefix.to_string())
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            Pattern::Suffix(suffix.to_string())
        } else {
            Pattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(exact) => exact == name,
            Pattern::Prefix(prefix) => name.starts_with(prefix.as_str()),
            Pattern::Suffix(suffix) => name.ends_with(suffix.as_str()),
        }
    }
}

impl From<&str> for Pattern {
    fn from(pattern: &str) -> Self {
        Pattern::parse(pattern)
    }
}

impl From<HookEvent> for Pattern {
    fn from(event: HookEvent) -> Self {
        Pattern::Exact(event.as_str().to_string())
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => f.write_str("*"),
            Pattern::Exact(name) => f.write_str(name),
            Pattern::Prefix(prefix) => write!(f, "{prefix}*"),
            Pattern::Suffix(suffix) => write!(f, "*{suffix}"),
        }
    }
}

/// State handed to hook handlers.
///
/// Before-hooks may rewrite `data` (writes) or `query` (reads); the engine
/// uses whatever they leave behind. After-hooks see the outcome in `result`.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub object: String,
    pub event: HookEvent,
    /// Record id for update, delete and find-one.
    pub id: Option<String>,
    /// Incoming write data.
    pub data: Option<Record>,
    /// Stored record before an update or delete.
    pub previous: Option<Record>,
    pub query: Option<UnifiedQuery>,
    /// Written record or found records.
    pub result: Option<Value>,
    pub user: Option<Map<String, Value>>,
    pub transaction: Option<TransactionHandle>,
    /// Scratch space carried from before- to after-hooks.
    pub state: Map<String, Value>,
}

impl HookContext {
    pub fn new(event: HookEvent, object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            event,
            id: None,
            data: None,
            previous: None,
            query: None,
            result: None,
            user: None,
            transaction: None,
            state: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: Record) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_previous(mut self, previous: Record) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn with_query(mut self, query: UnifiedQuery) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_user(mut self, user: Option<Map<String, Value>>) -> Self {
        self.user = user;
        self
    }

    pub fn with_transaction(mut self, transaction: Option<TransactionHandle>) -> Self {
        self.transaction = transaction;
        self
    }

    /// Move to the matching after-event, keeping data and state.
    pub fn into_after(mut self, result: Value) -> Self {
        self.event = match self.event {
            HookEvent::BeforeFind => HookEvent::AfterFind,
            HookEvent::BeforeCreate => HookEvent::AfterCreate,
            HookEvent::BeforeUpdate => HookEvent::AfterUpdate,
            HookEvent::BeforeDelete => HookEvent::AfterDelete,
            after => after,
        };
        self.result = Some(result);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_parse_and_match() {
        assert_eq!(Pattern::parse("*"), Pattern::Any);
        assert_eq!(Pattern::parse("before*"), Pattern::Prefix("before".into()));
        assert_eq!(Pattern::parse("*Create"), Pattern::Suffix("Create".into()));

        let before = Pattern::parse("before*");
        assert!(before.matches("beforeCreate"));
        assert!(!before.matches("afterCreate"));
        assert!(Pattern::parse("*Delete").matches("afterDelete"));
        assert!(Pattern::parse("account").matches("account"));
        assert!(!Pattern::parse("account").matches("accounts"));
        assert_eq!(Pattern::parse("crm_*").to_string(), "crm_*");
    }

    #[test]
    fn test_event_names() {
        assert_eq!("afterUpdate".parse::<HookEvent>().unwrap(), HookEvent::AfterUpdate);
        assert!("onSave".parse::<HookEvent>().is_err());
        assert!(HookEvent::BeforeDelete.is_before());
        assert_eq!(serde_json::to_value(HookEvent::BeforeFind).unwrap(), "beforeFind");

        let ctx = HookContext::new(HookEvent::BeforeUpdate, "task").into_after(Value::Null);
        assert_eq!(ctx.event, HookEvent::AfterUpdate);
    }
}
