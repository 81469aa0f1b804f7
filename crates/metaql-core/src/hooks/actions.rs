use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use metaql_proto::{Record, Value};
use parking_lot::RwLock;
use serde_json::Map;
use tracing::debug;

use crate::driver::TransactionHandle;
use crate::error::{Error, Result};

/// Input to an action handler.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub object: String,
    pub action: String,
    /// Target record for record-scoped actions.
    pub record_id: Option<String>,
    /// The stored target record, when the engine could load it.
    pub record: Option<Record>,
    pub params: Value,
    pub user: Option<Map<String, Value>>,
    pub transaction: Option<TransactionHandle>,
}

impl ActionContext {
    pub fn new(object: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            action: action.into(),
            params: Value::Null,
            ..Default::default()
        }
    }

    pub fn with_record_id(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_user(mut self, user: Option<Map<String, Value>>) -> Self {
        self.user = user;
        self
    }
}

/// Async action callback.
pub type ActionHandler = Arc<dyn Fn(ActionContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct ActionEntry {
    handler: ActionHandler,
    package: Option<String>,
}

/// Named actions keyed by `(object, name)`. Actions registered on `*`
/// apply to every object without its own action of that name.
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<BTreeMap<(String, String), ActionEntry>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an action.
    pub fn register_action<F>(&self, object: &str, name: &str, handler: F, package: Option<&str>)
    where
        F: Fn(ActionContext) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        debug!(object, action = name, package, "action registered");
        self.actions.write().insert(
            (object.to_string(), name.to_string()),
            ActionEntry {
                handler: Arc::new(handler),
                package: package.map(str::to_string),
            },
        );
    }

    pub fn unregister_action(&self, object: &str, name: &str) -> bool {
        self.actions
            .write()
            .remove(&(object.to_string(), name.to_string()))
            .is_some()
    }

    pub fn remove_package(&self, package: &str) -> usize {
        let mut actions = self.actions.write();
        let before = actions.len();
        actions.retain(|_, entry| entry.package.as_deref() != Some(package));
        before - actions.len()
    }

    pub fn has_action(&self, object: &str, name: &str) -> bool {
        self.lookup(object, name).is_some()
    }

    /// Action names available on `object`, including `*` actions.
    pub fn list(&self, object: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .actions
            .read()
            .keys()
            .filter(|(o, _)| o == object || o == "*")
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Run the action `name` on `object`.
    pub async fn execute_action(&self, object: &str, name: &str, ctx: ActionContext) -> Result<Value> {
        let handler = self
            .lookup(object, name)
            .ok_or_else(|| Error::Action(format!("action '{name}' is not registered on '{object}'")))?;
        debug!(object, action = name, record = ?ctx.record_id, "executing action");
        handler(ctx).await
    }

    fn lookup(&self, object: &str, name: &str) -> Option<ActionHandler> {
        let actions = self.actions.read();
        actions
            .get(&(object.to_string(), name.to_string()))
            .or_else(|| actions.get(&("*".to_string(), name.to_string())))
            .map(|entry| Arc::clone(&entry.handler))
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.actions.read().len())
            .finish()
    }
}
