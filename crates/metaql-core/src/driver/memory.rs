//! In-memory driver.
//!
//! Rows live in insertion order per table. A transaction works on a private
//! snapshot of every table that replaces the live tables on commit.

use std::collections::{BTreeMap, HashMap};

use metaql_proto::{Filter, Record, UnifiedQuery, Value};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::DriverError;
use crate::introspect::{IntrospectedColumn, IntrospectedSchema, IntrospectedTable};
use crate::query::{aggregate_records, matches, run_query};

use super::{ensure_id, Driver, DriverKind, DriverOptions, TransactionHandle};

#[derive(Debug, Clone, Default)]
struct Table {
    rows: BTreeMap<u64, Record>,
    ids: HashMap<String, u64>,
    next: u64,
}

impl Table {
    fn get(&self, id: &str) -> Option<&Record> {
        self.ids.get(id).and_then(|seq| self.rows.get(seq))
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Record> {
        let seq = self.ids.get(id)?;
        self.rows.get_mut(seq)
    }

    fn insert(&mut self, id: String, record: Record) {
        let seq = self.next;
        self.next += 1;
        self.ids.insert(id, seq);
        self.rows.insert(seq, record);
    }

    fn remove(&mut self, id: &str) -> Option<Record> {
        let seq = self.ids.remove(id)?;
        self.rows.remove(&seq)
    }

    fn records(&self) -> impl Iterator<Item = &Record> {
        self.rows.values()
    }
}

type Tables = HashMap<String, Table>;

#[derive(Default)]
struct MemoryState {
    tables: Tables,
    transactions: HashMap<String, Tables>,
}

/// Driver keeping every table in process memory.
pub struct MemoryDriver {
    name: String,
    state: RwLock<MemoryState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// Number of committed rows in a table.
    pub fn len(&self, table: &str) -> usize {
        self.state.read().tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    /// Open transactions.
    pub fn active_transactions(&self) -> usize {
        self.state.read().transactions.len()
    }

    fn read<T>(&self, opts: &DriverOptions, f: impl FnOnce(&Tables) -> T) -> Result<T, DriverError> {
        let state = self.state.read();
        match &opts.transaction {
            Some(handle) => state
                .transactions
                .get(handle.as_str())
                .map(f)
                .ok_or_else(|| DriverError::InvalidTransaction(handle.to_string())),
            None => Ok(f(&state.tables)),
        }
    }

    fn write<T>(
        &self,
        opts: &DriverOptions,
        f: impl FnOnce(&mut Tables) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let mut state = self.state.write();
        match &opts.transaction {
            Some(handle) => {
                let tables = state
                    .transactions
                    .get_mut(handle.as_str())
                    .ok_or_else(|| DriverError::InvalidTransaction(handle.to_string()))?;
                f(tables)
            }
            None => f(&mut state.tables),
        }
    }

    fn rows(&self, table: &str, opts: &DriverOptions) -> Result<Vec<Record>, DriverError> {
        self.read(opts, |tables| {
            tables
                .get(table)
                .map(|t| t.records().cloned().collect())
                .unwrap_or_default()
        })
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryDriver")
            .field("name", &self.name)
            .field("tables", &state.tables.len())
            .field("transactions", &state.transactions.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Memory
    }

    async fn find(&self, table: &str, query: &UnifiedQuery, opts: &DriverOptions) -> Result<Vec<Record>, DriverError> {
        if let Some(compiled) = &opts.plan {
            trace!(table, use_index = ?compiled.plan.use_index, "memory scan");
        }
        Ok(run_query(self.rows(table, opts)?, query))
    }

    async fn find_one(&self, table: &str, id: &str, opts: &DriverOptions) -> Result<Option<Record>, DriverError> {
        self.read(opts, |tables| tables.get(table).and_then(|t| t.get(id)).cloned())
    }

    async fn create(&self, table: &str, mut data: Record, opts: &DriverOptions) -> Result<Record, DriverError> {
        let id = ensure_id(&mut data);
        self.write(opts, |tables| {
            let rows = tables.entry(table.to_string()).or_default();
            if rows.get(&id).is_some() {
                return Err(DriverError::Duplicate {
                    object: table.to_string(),
                    id,
                });
            }
            rows.insert(id, data.clone());
            Ok(data)
        })
    }

    async fn update(&self, table: &str, id: &str, data: Record, opts: &DriverOptions) -> Result<Record, DriverError> {
        self.write(opts, |tables| {
            let record = tables
                .get_mut(table)
                .and_then(|t| t.get_mut(id))
                .ok_or_else(|| DriverError::NotFound {
                    object: table.to_string(),
                    id: id.to_string(),
                })?;
            for (key, value) in data {
                if key != "id" {
                    record.insert(key, value);
                }
            }
            Ok(record.clone())
        })
    }

    async fn delete(&self, table: &str, id: &str, opts: &DriverOptions) -> Result<Record, DriverError> {
        self.write(opts, |tables| {
            tables
                .get_mut(table)
                .and_then(|t| t.remove(id))
                .ok_or_else(|| DriverError::NotFound {
                    object: table.to_string(),
                    id: id.to_string(),
                })
        })
    }

    async fn count(&self, table: &str, filters: Option<&Filter>, opts: &DriverOptions) -> Result<usize, DriverError> {
        self.read(opts, |tables| {
            tables
                .get(table)
                .map(|t| match filters {
                    Some(filter) => t.records().filter(|r| matches(r, filter)).count(),
                    None => t.rows.len(),
                })
                .unwrap_or(0)
        })
    }

    async fn aggregate(&self, table: &str, query: &UnifiedQuery, opts: &DriverOptions) -> Result<Vec<Record>, DriverError> {
        Ok(aggregate_records(self.rows(table, opts)?, query))
    }

    async fn begin_transaction(&self) -> Result<Option<TransactionHandle>, DriverError> {
        let handle = TransactionHandle::new(uuid::Uuid::new_v4().to_string());
        let mut state = self.state.write();
        let snapshot = state.tables.clone();
        state.transactions.insert(handle.0.clone(), snapshot);
        debug!(driver = %self.name, transaction = %handle, "memory transaction started");
        Ok(Some(handle))
    }

    async fn commit_transaction(&self, handle: &TransactionHandle) -> Result<(), DriverError> {
        let mut state = self.state.write();
        let tables = state
            .transactions
            .remove(handle.as_str())
            .ok_or_else(|| DriverError::InvalidTransaction(handle.to_string()))?;
        state.tables = tables;
        Ok(())
    }

    async fn rollback_transaction(&self, handle: &TransactionHandle) -> Result<(), DriverError> {
        self.state
            .write()
            .transactions
            .remove(handle.as_str())
            .map(|_| ())
            .ok_or_else(|| DriverError::InvalidTransaction(handle.to_string()))
    }

    async fn introspect_schema(&self) -> Result<IntrospectedSchema, DriverError> {
        let state = self.state.read();
        let tables = state
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), describe(table)))
            .collect();
        Ok(IntrospectedSchema { tables })
    }
}

/// Infer columns from stored rows; the first non-null value decides a type.
pub(crate) fn describe<'a>(rows: impl IntoIterator<Item = &'a Record>) -> IntrospectedTable {
    let mut columns: BTreeMap<&str, Option<&'static str>> = BTreeMap::new();
    for row in rows {
        for (key, value) in row {
            let slot = columns.entry(key.as_str()).or_insert(None);
            if slot.is_none() {
                *slot = json_type(value);
            }
        }
    }
    IntrospectedTable {
        columns: columns
            .into_iter()
            .map(|(name, data_type)| {
                let column = IntrospectedColumn::new(name, data_type.unwrap_or("text"));
                if name == "id" {
                    column.primary()
                } else {
                    column
                }
            })
            .collect(),
        foreign_keys: Vec::new(),
    }
}

impl<'a> IntoIterator for &'a Table {
    type Item = &'a Record;
    type IntoIter = std::collections::btree_map::Values<'a, u64, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.values()
    }
}

fn json_type(value: &Value) -> Option<&'static str> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some("boolean"),
        Value::Number(_) => Some("number"),
        Value::String(_) => Some("text"),
        Value::Array(_) | Value::Object(_) => Some("json"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metaql_proto::SortSpec;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_crud_roundtrip() {
        let driver = MemoryDriver::new();
        let opts = DriverOptions::new();

        let created = driver
            .create("task", record(json!({"title": "write"})), &opts)
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let updated = driver
            .update("task", &id, record(json!({"done": true, "id": "other"})), &opts)
            .await
            .unwrap();
        assert_eq!(updated["id"], json!(id));
        assert_eq!(updated["done"], json!(true));

        let found = driver.find_one("task", &id, &opts).await.unwrap().unwrap();
        assert_eq!(found["title"], json!("write"));

        driver.delete("task", &id, &opts).await.unwrap();
        assert!(driver.find_one("task", &id, &opts).await.unwrap().is_none());
        assert!(matches!(
            driver.delete("task", &id, &opts).await,
            Err(DriverError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let driver = MemoryDriver::new();
        let opts = DriverOptions::new();
        driver.create("t", record(json!({"id": "1"})), &opts).await.unwrap();
        let err = driver.create("t", record(json!({"id": "1"})), &opts).await.unwrap_err();
        assert!(matches!(err, DriverError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_find_count_and_insertion_order() {
        let driver = MemoryDriver::new();
        let opts = DriverOptions::new();
        for (id, n) in [("c", 3), ("a", 1), ("b", 2)] {
            driver.create("n", record(json!({"id": id, "n": n})), &opts).await.unwrap();
        }

        let all = driver.find("n", &UnifiedQuery::new("n"), &opts).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        let sorted = driver
            .find("n", &UnifiedQuery::new("n").with_sort(SortSpec::asc("n")), &opts)
            .await
            .unwrap();
        assert_eq!(sorted[0]["id"], json!("a"));

        let filter = Filter::gt("n", 1);
        assert_eq!(driver.count("n", Some(&filter), &opts).await.unwrap(), 2);
        assert_eq!(driver.count("missing", None, &opts).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let driver = MemoryDriver::new();
        let plain = DriverOptions::new();

        let tx = driver.begin_transaction().await.unwrap().unwrap();
        let in_tx = DriverOptions::new().with_transaction(Some(tx.clone()));
        driver.create("t", record(json!({"id": "1"})), &in_tx).await.unwrap();
        assert_eq!(driver.len("t"), 0);
        assert!(driver.find_one("t", "1", &in_tx).await.unwrap().is_some());
        driver.commit_transaction(&tx).await.unwrap();
        assert_eq!(driver.len("t"), 1);

        let tx = driver.begin_transaction().await.unwrap().unwrap();
        let in_tx = DriverOptions::new().with_transaction(Some(tx.clone()));
        driver.delete("t", "1", &in_tx).await.unwrap();
        driver.rollback_transaction(&tx).await.unwrap();
        assert!(driver.find_one("t", "1", &plain).await.unwrap().is_some());
        assert_eq!(driver.active_transactions(), 0);

        let err = driver.find_one("t", "1", &in_tx).await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidTransaction(_)));
    }

    #[tokio::test]
    async fn test_introspect_infers_columns() {
        let driver = MemoryDriver::new();
        let opts = DriverOptions::new();
        driver
            .create("item", record(json!({"id": "1", "price": null, "name": "x"})), &opts)
            .await
            .unwrap();
        driver
            .create("item", record(json!({"id": "2", "price": 3.5, "tags": ["a"]})), &opts)
            .await
            .unwrap();

        let schema = driver.introspect_schema().await.unwrap();
        let columns = &schema.tables["item"].columns;
        let types: Vec<_> = columns
            .iter()
            .map(|c| (c.name.as_str(), c.data_type.as_str(), c.is_primary))
            .collect();
        assert_eq!(
            types,
            vec![
                ("id", "text", true),
                ("name", "text", false),
                ("price", "number", false),
                ("tags", "json", false),
            ]
        );
    }
}
