//! Query compilation.
//!
//! Turns a [`UnifiedQuery`] into a [`QueryPlan`] for one driver kind and
//! caches the result by structural fingerprint. The plan records index
//! hints and the joins a relational backend needs; for relational targets
//! a second pass tightens `LEFT` joins to `INNER` when a conjunctive filter
//! already rejects rows without a joined match.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use metaql_proto::{Filter, FilterOperator, Record, UnifiedQuery};
use serde::Serialize;
use serde_json::{json, Value as Json};
use tracing::debug;

use crate::catalog::{MetadataRegistry, ObjectDefinition, ReferenceKind};
use crate::driver::{Driver, DriverKind, DriverOptions};
use crate::error::{DriverError, Result, SchemaError};

use super::cache::{PlanCache, QueryFingerprint};

/// Join type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Left,
    Inner,
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Inner => "INNER JOIN",
        })
    }
}

/// A join through a reference field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Join {
    /// Reference field on the queried object.
    pub field: String,
    /// Referenced object.
    pub object: String,
    /// Backing table of the referenced object.
    pub table: String,
    pub kind: JoinKind,
    #[serde(skip)]
    pub reference: ReferenceKind,
}

/// Driver-targeted plan for one query shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub object: String,
    pub table: String,
    pub target: DriverKind,
    /// Filter fields backed by an index or unique constraint.
    pub use_index: Vec<String>,
    pub joins: Vec<Join>,
    pub fingerprint: QueryFingerprint,
}

/// A cached, executable plan.
#[derive(Debug)]
pub struct CompiledQuery {
    pub plan: QueryPlan,
    /// Registry version the plan was built against.
    pub schema_version: u64,
}

impl CompiledQuery {
    /// Run a query of this shape. Literal values come from `query`.
    pub async fn execute(
        self: &Arc<Self>,
        driver: &dyn Driver,
        query: &UnifiedQuery,
        opts: DriverOptions,
    ) -> std::result::Result<Vec<Record>, DriverError> {
        let opts = opts.with_plan(Arc::clone(self));
        if query.is_aggregate() {
            driver.aggregate(&self.plan.table, query, &opts).await
        } else {
            driver.find(&self.plan.table, query, &opts).await
        }
    }

    /// `{plan: {useIndex, joins}}` description for diagnostics.
    pub fn explain(&self) -> Json {
        json!({
            "object": self.plan.object,
            "target": self.plan.target,
            "fingerprint": self.plan.fingerprint.to_hex(),
            "plan": {
                "useIndex": self.plan.use_index,
                "joins": self.plan.joins,
            }
        })
    }

    pub fn join(&self, field: &str) -> Option<&Join> {
        self.plan.joins.iter().find(|j| j.field == field)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(object: &str, fingerprint: QueryFingerprint) -> Self {
        Self {
            plan: QueryPlan {
                object: object.to_string(),
                table: object.to_string(),
                target: DriverKind::Memory,
                use_index: Vec::new(),
                joins: Vec::new(),
                fingerprint,
            },
            schema_version: 0,
        }
    }
}

/// Compiles queries against registered objects.
pub struct QueryCompiler {
    registry: Arc<MetadataRegistry>,
    cache: PlanCache,
}

impl QueryCompiler {
    pub fn new(registry: Arc<MetadataRegistry>, capacity: usize) -> Self {
        Self {
            registry,
            cache: PlanCache::new(capacity),
        }
    }

    /// Compile `query` for a driver kind.
    ///
    /// Structurally equal queries return the same `Arc`. Fails with
    /// [`SchemaError::UnknownObject`] when the object is not registered.
    pub fn compile(&self, query: &UnifiedQuery, target: DriverKind) -> Result<Arc<CompiledQuery>> {
        let object = self.registry.require_object(&query.object)?;
        let version = self.registry.version();
        self.cache.sync_schema_version(version);

        let fingerprint = QueryFingerprint::from_query(query, target);
        if let Some(plan) = self.cache.get(&fingerprint) {
            return Ok(plan);
        }

        let plan = self.build_plan(&object, query, target, fingerprint)?;
        debug!(
            object = %plan.object,
            target = %target,
            fingerprint = %fingerprint.to_hex(),
            use_index = ?plan.use_index,
            joins = plan.joins.len(),
            "compiled query plan"
        );
        let compiled = Arc::new(CompiledQuery {
            plan,
            schema_version: version,
        });
        Ok(self.cache.insert(fingerprint, compiled))
    }

    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn build_plan(
        &self,
        object: &ObjectDefinition,
        query: &UnifiedQuery,
        target: DriverKind,
        fingerprint: QueryFingerprint,
    ) -> std::result::Result<QueryPlan, SchemaError> {
        let mut use_index = BTreeSet::new();
        let mut joined: BTreeMap<String, Join> = BTreeMap::new();

        for field in query.expand.keys() {
            let join = self.join_for(object, field)?;
            joined.insert(field.clone(), join);
        }

        if let Some(filter) = &query.filters {
            let mut failure = None;
            filter.for_each_condition(&mut |condition| {
                match condition.field.split_once('.') {
                    None => {
                        if condition.operator.is_index_friendly() && object.is_indexed(&condition.field) {
                            use_index.insert(condition.field.clone());
                        }
                    }
                    Some((head, _)) if !joined.contains_key(head) && failure.is_none() => {
                        match self.join_for(object, head) {
                            Ok(join) => {
                                joined.insert(head.to_string(), join);
                            }
                            Err(e) => failure = Some(e),
                        }
                    }
                    Some(_) => {}
                }
            });
            if let Some(e) = failure {
                return Err(e);
            }

            if target == DriverKind::Relational {
                let mut required = BTreeSet::new();
                null_rejecting_joins(filter, &mut required);
                for head in required {
                    if let Some(join) = joined.get_mut(&head) {
                        if join.kind == JoinKind::Left {
                            debug!(field = %head, "tightening LEFT JOIN to INNER JOIN");
                            join.kind = JoinKind::Inner;
                        }
                    }
                }
            }
        }

        Ok(QueryPlan {
            object: object.name.clone(),
            table: object.table_name().to_string(),
            target,
            use_index: use_index.into_iter().collect(),
            joins: joined.into_values().collect(),
            fingerprint,
        })
    }

    fn join_for(&self, object: &ObjectDefinition, field: &str) -> std::result::Result<Join, SchemaError> {
        let definition = object.field(field).ok_or_else(|| SchemaError::UnknownField {
            object: object.name.clone(),
            field: field.to_string(),
        })?;
        let reference = object
            .references()
            .find(|r| r.field == field)
            .ok_or_else(|| SchemaError::NotAReference {
                object: object.name.clone(),
                field: field.to_string(),
            })?;
        let target = definition.reference_to.clone().unwrap_or_default();
        let table = self
            .registry
            .get_object(&target)
            .map(|o| o.table_name().to_string())
            .unwrap_or_else(|| target.clone());

        Ok(Join {
            field: field.to_string(),
            object: target,
            table,
            kind: JoinKind::Left,
            reference: reference.kind,
        })
    }
}

impl fmt::Debug for QueryCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCompiler").field("cache", &self.cache).finish()
    }
}

/// Reference fields whose joined columns appear in top-level conjuncts with
/// an operator that cannot match a missing row.
fn null_rejecting_joins(filter: &Filter, out: &mut BTreeSet<String>) {
    match filter {
        Filter::Condition(condition) => {
            if condition.operator == FilterOperator::IsNull {
                return;
            }
            if let Some((head, _)) = condition.field.split_once('.') {
                out.insert(head.to_string());
            }
        }
        Filter::And(items) => {
            for item in items {
                null_rejecting_joins(item, out);
            }
        }
        Filter::Or(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldDefinition, IndexDefinition};
    use metaql_proto::{ExpandSpec, SortSpec};

    fn registry() -> Arc<MetadataRegistry> {
        let registry = Arc::new(MetadataRegistry::new());
        registry
            .register_object(
                ObjectDefinition::new("account")
                    .with_field("name", FieldDefinition::text().unique())
                    .with_field("industry", FieldDefinition::text()),
                None,
            )
            .unwrap();
        registry
            .register_object(
                ObjectDefinition::new("contact")
                    .with_field("email", FieldDefinition::text().indexed())
                    .with_field("last_name", FieldDefinition::text())
                    .with_field("city", FieldDefinition::text())
                    .with_field("account", FieldDefinition::master_detail("account"))
                    .with_field("manager", FieldDefinition::lookup("contact"))
                    .with_index(IndexDefinition::on(["city", "last_name"])),
                None,
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_unknown_object_is_schema_error() {
        let compiler = QueryCompiler::new(registry(), 16);
        let err = compiler
            .compile(&UnifiedQuery::new("ghost"), DriverKind::Memory)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
    }

    #[test]
    fn test_same_shape_same_instance() {
        let compiler = QueryCompiler::new(registry(), 16);
        let a = UnifiedQuery::new("contact")
            .with_filter(Filter::eq("email", "a@x.io"))
            .with_sort(SortSpec::asc("last_name"))
            .with_top(10);
        let b = UnifiedQuery::new("contact")
            .with_filter(Filter::eq("email", "b@y.io"))
            .with_sort(SortSpec::asc("last_name"))
            .with_top(25);
        let c = UnifiedQuery::new("contact").with_filter(Filter::eq("last_name", "Smith"));

        let plan_a = compiler.compile(&a, DriverKind::Memory).unwrap();
        let plan_b = compiler.compile(&b, DriverKind::Memory).unwrap();
        let plan_c = compiler.compile(&c, DriverKind::Memory).unwrap();

        assert!(Arc::ptr_eq(&plan_a, &plan_b));
        assert!(!Arc::ptr_eq(&plan_a, &plan_c));
        assert_eq!(compiler.cache().stats().hits(), 1);
    }

    #[test]
    fn test_index_hints() {
        let compiler = QueryCompiler::new(registry(), 16);
        let query = UnifiedQuery::new("contact").with_filter(
            Filter::eq("email", "a@x.io")
                .and(Filter::eq("city", "Oslo"))
                .and(Filter::eq("last_name", "Smith"))
                .and(Filter::condition("id", FilterOperator::In, serde_json::json!(["1", "2"]))),
        );
        let compiled = compiler.compile(&query, DriverKind::Memory).unwrap();
        assert_eq!(compiled.plan.use_index, vec!["city", "email", "id"]);

        let like = UnifiedQuery::new("contact")
            .with_filter(Filter::condition("email", FilterOperator::Contains, "x.io"));
        let compiled = compiler.compile(&like, DriverKind::Memory).unwrap();
        assert!(compiled.plan.use_index.is_empty());

        let account = UnifiedQuery::new("account").with_filter(Filter::eq("name", "Acme"));
        let compiled = compiler.compile(&account, DriverKind::Memory).unwrap();
        assert_eq!(compiled.plan.use_index, vec!["name"]);
    }

    #[test]
    fn test_relational_join_tightening() {
        let compiler = QueryCompiler::new(registry(), 16);
        let query = UnifiedQuery::new("contact")
            .with_expand("account", ExpandSpec::default())
            .with_expand("manager", ExpandSpec::default())
            .with_filter(Filter::eq("account.industry", "Energy"));

        let relational = compiler.compile(&query, DriverKind::Relational).unwrap();
        assert_eq!(relational.join("account").unwrap().kind, JoinKind::Inner);
        assert_eq!(relational.join("manager").unwrap().kind, JoinKind::Left);
        assert_eq!(relational.join("account").unwrap().reference, ReferenceKind::MasterDetail);

        let document = compiler.compile(&query, DriverKind::Document).unwrap();
        assert_eq!(document.join("account").unwrap().kind, JoinKind::Left);

        let either = UnifiedQuery::new("contact").with_filter(
            Filter::eq("account.industry", "Energy").or(Filter::eq("city", "Oslo")),
        );
        let compiled = compiler.compile(&either, DriverKind::Relational).unwrap();
        assert_eq!(compiled.join("account").unwrap().kind, JoinKind::Left);
    }

    #[test]
    fn test_expand_requires_reference() {
        let compiler = QueryCompiler::new(registry(), 16);
        let query = UnifiedQuery::new("contact").with_expand("city", ExpandSpec::default());
        let err = compiler.compile(&query, DriverKind::Memory).unwrap_err();
        assert!(err.to_string().contains("not a reference"));

        let query = UnifiedQuery::new("contact").with_filter(Filter::eq("nope.x", 1));
        assert!(compiler.compile(&query, DriverKind::Memory).is_err());
    }

    #[test]
    fn test_schema_change_invalidates() {
        let registry = registry();
        let compiler = QueryCompiler::new(Arc::clone(&registry), 16);
        let query = UnifiedQuery::new("contact");
        let before = compiler.compile(&query, DriverKind::Memory).unwrap();

        registry
            .register_object(ObjectDefinition::new("task"), None)
            .unwrap();
        let after = compiler.compile(&query, DriverKind::Memory).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.schema_version, registry.version());

        let explained = after.explain();
        assert_eq!(explained["plan"]["useIndex"], serde_json::json!([]));
    }
}
