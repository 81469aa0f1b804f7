//! Storage driver contract.
//!
//! A driver adapts one storage technology to the engine. Required methods
//! cover reads and writes; transactions, aggregation and introspection are
//! optional and default to "unsupported" (or, for transactions, to running
//! without a handle).

mod memory;
mod document;

use std::fmt;
use std::sync::Arc;

use metaql_proto::{Filter, Record, UnifiedQuery, Value};
use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::introspect::IntrospectedSchema;
use crate::query::CompiledQuery;

pub use self::memory::MemoryDriver;
pub use self::document::SledDriver;

/// Family of storage a driver targets. Selects compiler passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Memory,
    Document,
    Relational,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Memory => "memory",
            DriverKind::Document => "document",
            DriverKind::Relational => "relational",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque driver transaction handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionHandle(pub String);

impl TransactionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct DriverOptions {
    /// Run inside this transaction.
    pub transaction: Option<TransactionHandle>,
    /// Compiled plan for reads; carries index and join hints.
    pub plan: Option<Arc<CompiledQuery>>,
}

impl DriverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transaction(mut self, handle: Option<TransactionHandle>) -> Self {
        self.transaction = handle;
        self
    }

    pub fn with_plan(mut self, plan: Arc<CompiledQuery>) -> Self {
        self.plan = Some(plan);
        self
    }
}

/// A storage backend.
///
/// `table` is the backing table/collection name of an object.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    /// Name used for pool limits and logs.
    fn name(&self) -> &str;

    fn kind(&self) -> DriverKind;

    async fn find(&self, table: &str, query: &UnifiedQuery, opts: &DriverOptions) -> Result<Vec<Record>, DriverError>;

    async fn find_one(&self, table: &str, id: &str, opts: &DriverOptions) -> Result<Option<Record>, DriverError>;

    /// Insert a record. An id is generated when `data` has none.
    async fn create(&self, table: &str, data: Record, opts: &DriverOptions) -> Result<Record, DriverError>;

    /// Merge `data` into the stored record and return the result.
    async fn update(&self, table: &str, id: &str, data: Record, opts: &DriverOptions) -> Result<Record, DriverError>;

    /// Remove a record and return what was stored.
    async fn delete(&self, table: &str, id: &str, opts: &DriverOptions) -> Result<Record, DriverError>;

    async fn count(&self, table: &str, filters: Option<&Filter>, opts: &DriverOptions) -> Result<usize, DriverError>;

    /// Grouped aggregation.
    async fn aggregate(
        &self,
        _table: &str,
        _query: &UnifiedQuery,
        _opts: &DriverOptions,
    ) -> Result<Vec<Record>, DriverError> {
        Err(self.unsupported("aggregate"))
    }

    /// Start a transaction. `None` means the driver has no transactions and
    /// the work runs without one.
    async fn begin_transaction(&self) -> Result<Option<TransactionHandle>, DriverError> {
        Ok(None)
    }

    async fn commit_transaction(&self, _handle: &TransactionHandle) -> Result<(), DriverError> {
        Ok(())
    }

    async fn rollback_transaction(&self, _handle: &TransactionHandle) -> Result<(), DriverError> {
        Ok(())
    }

    /// Describe the existing tables of the backend.
    async fn introspect_schema(&self) -> Result<IntrospectedSchema, DriverError> {
        Err(self.unsupported("introspect_schema"))
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        Ok(())
    }

    fn unsupported(&self, operation: &str) -> DriverError {
        DriverError::Unsupported {
            driver: self.name().to_string(),
            operation: operation.to_string(),
        }
    }
}

/// Id of a record being created: the given one or a fresh UUID.
pub(crate) fn ensure_id(data: &mut Record) -> String {
    match data.get("id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => {
            let id = uuid::Uuid::new_v4().to_string();
            data.insert("id".to_string(), Value::String(id.clone()));
            id
        }
    }
}
