use metaql_proto::Value;
use serde_json::Map;

use crate::driver::TransactionHandle;

/// Caller context threaded through every engine operation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Attributes of the acting user, visible to formulas as
    /// `$current_user.*` and to hooks.
    pub user: Option<Map<String, Value>>,
    scope: Option<TransactionScope>,
}

#[derive(Debug, Clone)]
struct TransactionScope {
    datasource: String,
    handle: Option<TransactionHandle>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context acting as `user`.
    pub fn with_user(mut self, user: Map<String, Value>) -> Self {
        self.user = Some(user);
        self
    }

    /// Handle of the enclosing transaction. `None` outside a transaction
    /// and inside one on a driver without transaction support.
    pub fn transaction_handle(&self) -> Option<&TransactionHandle> {
        self.scope.as_ref().and_then(|s| s.handle.as_ref())
    }

    /// Datasource of the enclosing transaction.
    pub fn transaction_datasource(&self) -> Option<&str> {
        self.scope.as_ref().map(|s| s.datasource.as_str())
    }

    pub fn in_transaction(&self) -> bool {
        self.scope.is_some()
    }

    pub(crate) fn in_scope(mut self, datasource: &str, handle: Option<TransactionHandle>) -> Self {
        self.scope = Some(TransactionScope {
            datasource: datasource.to_string(),
            handle,
        });
        self
    }

    /// Whether the enclosing transaction already holds a pool slot for
    /// `datasource`.
    pub(crate) fn holds(&self, datasource: &str) -> bool {
        self.transaction_datasource() == Some(datasource)
    }

    /// Handle to pass to a driver of `datasource`.
    pub(crate) fn handle_for(&self, datasource: &str) -> Option<TransactionHandle> {
        if self.holds(datasource) {
            self.transaction_handle().cloned()
        } else {
            None
        }
    }
}
