//! Document driver backed by sled.
//!
//! Each table is a sled tree named `table:<name>`, keyed by record id with
//! the record stored as JSON. Reads scan the tree and evaluate the query in
//! process. There are no transactions: every write is applied immediately.

use std::path::Path;

use metaql_proto::{Filter, Record, UnifiedQuery};
use sled::{Db, Tree};
use tracing::{debug, trace};

use crate::error::DriverError;
use crate::introspect::IntrospectedSchema;
use crate::query::{aggregate_records, matches, run_query};

use super::memory::describe;
use super::{ensure_id, Driver, DriverKind, DriverOptions};

/// Tree name prefix for tables.
const TABLE_PREFIX: &str = "table:";

/// Driver storing one sled tree per table.
pub struct SledDriver {
    name: String,
    db: Db,
}

impl SledDriver {
    /// Open or create a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let db = sled::Config::new().path(path.as_ref()).open()?;
        debug!(path = %path.as_ref().display(), recovered = db.was_recovered(), "opened sled driver");
        Ok(Self::from_db(db))
    }

    /// A database that is removed when dropped.
    pub fn temporary() -> Result<Self, DriverError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::from_db(db))
    }

    pub fn from_db(db: Db) -> Self {
        Self {
            name: "sled".to_string(),
            db,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn tree(&self, table: &str) -> Result<Tree, DriverError> {
        Ok(self.db.open_tree(format!("{TABLE_PREFIX}{table}"))?)
    }

    fn scan(&self, table: &str) -> Result<Vec<Record>, DriverError> {
        self.tree(table)?
            .iter()
            .values()
            .map(|value| Ok(serde_json::from_slice(&value?)?))
            .collect()
    }

    fn not_found(table: &str, id: &str) -> DriverError {
        DriverError::NotFound {
            object: table.to_string(),
            id: id.to_string(),
        }
    }
}

impl std::fmt::Debug for SledDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledDriver").field("name", &self.name).finish()
    }
}

#[async_trait::async_trait]
impl Driver for SledDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Document
    }

    async fn find(&self, table: &str, query: &UnifiedQuery, opts: &DriverOptions) -> Result<Vec<Record>, DriverError> {
        if let Some(compiled) = &opts.plan {
            trace!(table, fingerprint = %compiled.plan.fingerprint, "sled scan");
        }
        Ok(run_query(self.scan(table)?, query))
    }

    async fn find_one(&self, table: &str, id: &str, _opts: &DriverOptions) -> Result<Option<Record>, DriverError> {
        match self.tree(table)?.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, table: &str, mut data: Record, _opts: &DriverOptions) -> Result<Record, DriverError> {
        let id = ensure_id(&mut data);
        let bytes = serde_json::to_vec(&data)?;
        let swapped = self
            .tree(table)?
            .compare_and_swap(id.as_bytes(), None as Option<&[u8]>, Some(bytes))?;
        if swapped.is_err() {
            return Err(DriverError::Duplicate {
                object: table.to_string(),
                id,
            });
        }
        Ok(data)
    }

    async fn update(&self, table: &str, id: &str, data: Record, _opts: &DriverOptions) -> Result<Record, DriverError> {
        let tree = self.tree(table)?;
        let bytes = tree.get(id.as_bytes())?.ok_or_else(|| Self::not_found(table, id))?;
        let mut record: Record = serde_json::from_slice(&bytes)?;
        for (key, value) in data {
            if key != "id" {
                record.insert(key, value);
            }
        }
        tree.insert(id.as_bytes(), serde_json::to_vec(&record)?)?;
        Ok(record)
    }

    async fn delete(&self, table: &str, id: &str, _opts: &DriverOptions) -> Result<Record, DriverError> {
        let bytes = self
            .tree(table)?
            .remove(id.as_bytes())?
            .ok_or_else(|| Self::not_found(table, id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn count(&self, table: &str, filters: Option<&Filter>, _opts: &DriverOptions) -> Result<usize, DriverError> {
        match filters {
            Some(filter) => Ok(self.scan(table)?.iter().filter(|r| matches(r, filter)).count()),
            None => Ok(self.tree(table)?.len()),
        }
    }

    async fn aggregate(&self, table: &str, query: &UnifiedQuery, _opts: &DriverOptions) -> Result<Vec<Record>, DriverError> {
        Ok(aggregate_records(self.scan(table)?, query))
    }

    async fn introspect_schema(&self) -> Result<IntrospectedSchema, DriverError> {
        let mut schema = IntrospectedSchema::default();
        for name in self.db.tree_names() {
            let name = String::from_utf8_lossy(&name);
            let Some(table) = name.strip_prefix(TABLE_PREFIX) else {
                continue;
            };
            let rows = self.scan(table)?;
            schema.tables.insert(table.to_string(), describe(&rows));
        }
        Ok(schema)
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.db.flush_async().await?;
        Ok(())
    }
}
