use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use metaql_formula::FormulaContext;
use metaql_proto::{record_id, ExpandSpec, Filter, Record, UnifiedQuery, Value};
use tracing::{debug, warn};

use crate::catalog::{FieldDefinition, ObjectDefinition};
use crate::error::{Result, SchemaError};
use crate::hooks::{HookContext, HookEvent};
use crate::query::executor::project;
use crate::query::{aggregate_records, run_query};

use super::{Context, Engine};

impl Engine {
    /// Run a query against `object`.
    ///
    /// Formula fields are computed per record; one that fails to evaluate
    /// reads as `null`. Filters and sorts on formula fields or dotted lookup
    /// paths are evaluated in process after the driver returns.
    pub async fn find(&self, object: &str, mut query: UnifiedQuery, ctx: &Context) -> Result<Vec<Record>> {
        let def = self.object(object)?;
        query.object = object.to_string();

        let mut hook_ctx = HookContext::new(HookEvent::BeforeFind, object)
            .with_query(query)
            .with_user(ctx.user.clone())
            .with_transaction(ctx.transaction_handle().cloned());
        self.inner
            .hooks
            .run_hooks(HookEvent::BeforeFind, object, &mut hook_ctx)
            .await?;
        let query = hook_ctx.query.take().unwrap_or_else(|| UnifiedQuery::new(object));

        let records = self.load(&def, &query, ctx).await?;

        let mut hook_ctx = hook_ctx.into_after(Value::Array(records.into_iter().map(Value::Object).collect()));
        self.inner
            .hooks
            .run_hooks(HookEvent::AfterFind, object, &mut hook_ctx)
            .await?;
        Ok(records_from(hook_ctx.result))
    }

    /// Load one record by id.
    pub async fn find_one(&self, object: &str, id: &str, ctx: &Context) -> Result<Option<Record>> {
        let def = self.object(object)?;

        let mut hook_ctx = HookContext::new(HookEvent::BeforeFind, object)
            .with_id(id)
            .with_user(ctx.user.clone())
            .with_transaction(ctx.transaction_handle().cloned());
        self.inner
            .hooks
            .run_hooks(HookEvent::BeforeFind, object, &mut hook_ctx)
            .await?;

        let mut record = self.fetch_by_id(&def, id, ctx).await?;
        if let Some(record) = record.as_mut() {
            let formulas = self.formula_order(&def, None);
            self.apply_formulas(&def, &formulas, std::slice::from_mut(record), false, ctx)
                .await?;
        }

        let mut hook_ctx = hook_ctx.into_after(record.map(Value::Object).unwrap_or(Value::Null));
        self.inner
            .hooks
            .run_hooks(HookEvent::AfterFind, object, &mut hook_ctx)
            .await?;
        Ok(match hook_ctx.result {
            Some(Value::Object(record)) => Some(record),
            _ => None,
        })
    }

    /// Count records matching `filter`.
    pub async fn count(&self, object: &str, filter: Option<Filter>, ctx: &Context) -> Result<usize> {
        let def = self.object(object)?;
        let mut query = UnifiedQuery::new(object);
        query.filters = filter;

        if self.needs_local(&def, &query) {
            return Ok(self.load(&def, &query, ctx).await?.len());
        }

        let datasource = self.datasource_name(&def);
        let table = def.table_name();
        let filter = query.filters.as_ref();
        self.with_driver(datasource, ctx, |driver, opts| async move {
            Ok(driver.count(table, filter, &opts).await?)
        })
        .await
    }

    /// Grouped aggregation. A query without aggregations counts rows.
    pub async fn aggregate(&self, object: &str, mut query: UnifiedQuery, ctx: &Context) -> Result<Vec<Record>> {
        if query.aggregate.is_empty() {
            query.aggregate.push(metaql_proto::Aggregation::count());
        }
        self.find(object, query, ctx).await
    }

    /// Driver fetch, formulas, expansion and in-process evaluation of
    /// whatever the driver could not do.
    async fn load(&self, def: &ObjectDefinition, query: &UnifiedQuery, ctx: &Context) -> Result<Vec<Record>> {
        let local = self.needs_local(def, query);
        let output = output_fields(query);

        let driver_query = if local {
            UnifiedQuery {
                object: query.object.clone(),
                expand: query.expand.clone(),
                ..UnifiedQuery::new(&query.object)
            }
        } else {
            let mut driver_query = query.clone();
            if let Some(fields) = &output {
                driver_query.fields = Some(self.driver_projection(def, fields));
            }
            driver_query
        };

        let mut records = self.fetch_rows(def, &driver_query, ctx).await?;
        if !local && query.is_aggregate() {
            return Ok(records);
        }

        let implicit = if local { implicit_expands(query) } else { BTreeSet::new() };
        for (field, spec) in &query.expand {
            self.expand_field(def, field, spec, &mut records, ctx).await?;
        }
        for field in &implicit {
            self.expand_field(def, field, &ExpandSpec::default(), &mut records, ctx).await?;
        }

        let formulas = self.formula_order(def, if local { None } else { output.as_deref() });
        self.apply_formulas(def, &formulas, &mut records, false, ctx).await?;

        if local {
            debug!(object = %def.name, rows = records.len(), "evaluating query in process");
            records = if query.is_aggregate() {
                aggregate_records(records, query)
            } else {
                let mut query = query.clone();
                query.fields = output;
                run_query(records, &query)
            };
            for record in records.iter_mut() {
                collapse(record, &implicit);
            }
            Ok(records)
        } else {
            Ok(match output {
                Some(fields) => records.into_iter().map(|r| project(r, &fields)).collect(),
                None => records,
            })
        }
    }

    /// Compile `query` for the object's driver and run it.
    pub(super) async fn fetch_rows(
        &self,
        def: &ObjectDefinition,
        query: &UnifiedQuery,
        ctx: &Context,
    ) -> Result<Vec<Record>> {
        let compiler = &self.inner.compiler;
        self.with_driver(self.datasource_name(def), ctx, |driver, opts| async move {
            let plan = compiler.compile(query, driver.kind())?;
            Ok(plan.execute(driver.as_ref(), query, opts).await?)
        })
        .await
    }

    pub(super) async fn fetch_by_id(&self, def: &ObjectDefinition, id: &str, ctx: &Context) -> Result<Option<Record>> {
        let table = def.table_name();
        self.with_driver(self.datasource_name(def), ctx, |driver, opts| async move {
            Ok(driver.find_one(table, id, &opts).await?)
        })
        .await
    }

    /// Replace the reference ids in `field` with the referenced records,
    /// using one batched `in` query.
    async fn expand_field(
        &self,
        def: &ObjectDefinition,
        field: &str,
        spec: &ExpandSpec,
        records: &mut [Record],
        ctx: &Context,
    ) -> Result<()> {
        let reference = def.field(field).ok_or_else(|| SchemaError::UnknownField {
            object: def.name.clone(),
            field: field.to_string(),
        })?;
        let target = match (&reference.reference_to, reference.field_type.is_reference()) {
            (Some(target), true) => self.object(target)?,
            _ => {
                return Err(SchemaError::NotAReference {
                    object: def.name.clone(),
                    field: field.to_string(),
                }
                .into())
            }
        };

        let mut keys = BTreeSet::new();
        let ids: Vec<Value> = records
            .iter()
            .filter_map(|r| r.get(field))
            .filter(|v| key_of(v).map(|k| keys.insert(k)).unwrap_or(false))
            .cloned()
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        let pk = target.primary_key().to_string();
        let query = UnifiedQuery::new(&target.name).with_filter(Filter::in_values(pk.clone(), ids));
        let mut related = self.fetch_rows(&target, &query, ctx).await?;
        let formulas = self.formula_order(&target, None);
        for record in related.iter_mut() {
            self.compute_formulas(&formulas, record, false, ctx);
        }
        if spec.filters.is_some() || spec.fields.is_some() {
            let mut refine = UnifiedQuery::new(&target.name);
            refine.filters = spec.filters.clone();
            refine.fields = spec.fields.clone().map(|mut fields| {
                if !fields.contains(&pk) {
                    fields.push(pk.clone());
                }
                fields
            });
            related = run_query(related, &refine);
        }

        let by_key: HashMap<String, Record> = related
            .into_iter()
            .filter_map(|r| r.get(&pk).and_then(key_of).map(|k| (k, r)))
            .collect();
        debug!(object = %def.name, field, target = %target.name, matched = by_key.len(), "expanded lookup");

        for record in records.iter_mut() {
            let Some(key) = record.get(field).and_then(key_of) else {
                continue;
            };
            let expanded = by_key.get(&key).cloned().map(Value::Object).unwrap_or(Value::Null);
            record.insert(field.to_string(), expanded);
        }
        Ok(())
    }

    /// Whether filters, sorts or aggregates touch something only the engine
    /// can evaluate: a formula field or a dotted lookup path.
    pub(super) fn needs_local(&self, def: &ObjectDefinition, query: &UnifiedQuery) -> bool {
        let engine_only = |field: &str| field.contains('.') || def.field(field).map(|f| f.is_formula()).unwrap_or(false);
        query.filters.as_ref().map(|f| f.fields().iter().any(|f| engine_only(f))).unwrap_or(false)
            || query.sort.iter().any(|s| engine_only(&s.field))
            || query.group_by.iter().any(|g| engine_only(g))
            || query
                .aggregate
                .iter()
                .filter_map(|a| a.field.as_deref())
                .any(engine_only)
    }

    /// Projection sent to the driver: requested stored fields plus whatever
    /// the requested formula fields read.
    fn driver_projection(&self, def: &ObjectDefinition, fields: &[String]) -> Vec<String> {
        let mut projection: BTreeSet<String> = BTreeSet::new();
        for field in fields {
            match def.field(field) {
                Some(f) if f.is_formula() => {}
                _ => {
                    projection.insert(field.clone());
                }
            }
        }
        for formula in self.formula_order(def, Some(fields)) {
            for dep in self.formula_dependencies(formula) {
                if !def.field(&dep).map(|f| f.is_formula()).unwrap_or(false) {
                    projection.insert(dep);
                }
            }
        }
        projection.into_iter().collect()
    }

    fn formula_dependencies(&self, field: &FieldDefinition) -> BTreeSet<String> {
        let Some(expression) = field.formula.as_deref() else {
            return BTreeSet::new();
        };
        match self
            .inner
            .formulas
            .extract_metadata(&field.name, expression, field.formula_type())
        {
            Ok(meta) => meta.dependencies,
            Err(_) => BTreeSet::new(),
        }
    }

    /// Formula fields to compute, dependencies first. `wanted` limits the
    /// set to those fields and the formulas they read.
    pub(super) fn formula_order<'d>(
        &self,
        def: &'d ObjectDefinition,
        wanted: Option<&[String]>,
    ) -> Vec<&'d FieldDefinition> {
        let deps: BTreeMap<&str, BTreeSet<String>> = def
            .formula_fields()
            .map(|f| (f.name.as_str(), self.formula_dependencies(f)))
            .collect();
        if deps.is_empty() {
            return Vec::new();
        }

        let mut selected: BTreeSet<&str> = match wanted {
            None => deps.keys().copied().collect(),
            Some(fields) => fields
                .iter()
                .filter_map(|f| deps.get_key_value(f.as_str()).map(|(k, _)| *k))
                .collect(),
        };
        let mut stack: Vec<&str> = selected.iter().copied().collect();
        while let Some(name) = stack.pop() {
            for dep in &deps[name] {
                if let Some((key, _)) = deps.get_key_value(dep.as_str()) {
                    if selected.insert(key) {
                        stack.push(key);
                    }
                }
            }
        }

        let mut ordered: Vec<&str> = Vec::with_capacity(selected.len());
        let mut done: BTreeSet<&str> = BTreeSet::new();
        while done.len() < selected.len() {
            let mut ready: Vec<&str> = selected
                .iter()
                .copied()
                .filter(|name| !done.contains(name))
                .filter(|name| {
                    deps[*name]
                        .iter()
                        .all(|d| d == name || !selected.contains(d.as_str()) || done.contains(d.as_str()))
                })
                .collect();
            if ready.is_empty() {
                // Formulas reading each other; evaluate the rest by name.
                ready = selected.iter().copied().filter(|name| !done.contains(name)).collect();
            }
            for name in ready {
                done.insert(name);
                ordered.push(name);
            }
        }

        ordered.into_iter().filter_map(|name| def.field(name)).collect()
    }

    /// Compute `formulas` into `records`. Reference fields that a formula
    /// reads through (`account.name`) are expanded for the evaluation and
    /// restored to their stored values afterwards.
    pub(super) async fn apply_formulas(
        &self,
        def: &ObjectDefinition,
        formulas: &[&FieldDefinition],
        records: &mut [Record],
        is_new: bool,
        ctx: &Context,
    ) -> Result<()> {
        if formulas.is_empty() || records.is_empty() {
            return Ok(());
        }

        let heads = self.lookup_heads(def, formulas);
        let stored: Vec<Vec<(String, Value)>> = records
            .iter()
            .map(|record| {
                heads
                    .iter()
                    .filter_map(|head| match record.get(head) {
                        Some(value) if key_of(value).is_some() => Some((head.clone(), value.clone())),
                        _ => None,
                    })
                    .collect()
            })
            .collect();
        for head in &heads {
            self.expand_field(def, head, &ExpandSpec::default(), records, ctx).await?;
        }

        for record in records.iter_mut() {
            self.compute_formulas(formulas, record, is_new, ctx);
        }
        for (record, stored) in records.iter_mut().zip(stored) {
            record.extend(stored);
        }
        Ok(())
    }

    /// Reference fields at the head of a formula's lookup chains.
    fn lookup_heads(&self, def: &ObjectDefinition, formulas: &[&FieldDefinition]) -> BTreeSet<String> {
        formulas
            .iter()
            .filter_map(|field| {
                let expression = field.formula.as_deref()?;
                self.inner
                    .formulas
                    .extract_metadata(&field.name, expression, field.formula_type())
                    .ok()
            })
            .flat_map(|meta| meta.lookup_chains)
            .filter_map(|chain| chain.split_once('.').map(|(head, _)| head.to_string()))
            .filter(|head| def.field(head).map(|f| f.field_type.is_reference()).unwrap_or(false))
            .collect()
    }

    /// Evaluate formula fields into `record`. Failures become `null`.
    /// `is_new` is what `$is_new` reads: true only for a record just created.
    pub(super) fn compute_formulas(
        &self,
        formulas: &[&FieldDefinition],
        record: &mut Record,
        is_new: bool,
        ctx: &Context,
    ) {
        let id = record_id(record);
        // `$now` is fixed for every field of one record.
        let now = Utc::now();
        for field in formulas {
            let Some(expression) = field.formula.as_deref() else {
                continue;
            };
            let value = {
                let mut fctx = FormulaContext::new(&*record).with_now(now).with_is_new(is_new);
                if let Some(user) = ctx.user.as_ref() {
                    fctx = fctx.with_user(user);
                }
                if let Some(id) = &id {
                    fctx = fctx.with_record_id(id.clone());
                }
                match self.inner.formulas.evaluate(expression, &fctx, field.formula_type()) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(field = %field.name, error = %err, "formula evaluation failed, using null");
                        Value::Null
                    }
                }
            };
            record.insert(field.name.clone(), value);
        }
    }
}

/// Requested projection plus expanded fields.
fn output_fields(query: &UnifiedQuery) -> Option<Vec<String>> {
    query.fields.as_ref().map(|fields| {
        let mut fields = fields.clone();
        for field in query.expand.keys() {
            if !fields.contains(field) {
                fields.push(field.clone());
            }
        }
        fields
    })
}

/// Heads of dotted filter and sort paths that the query does not expand.
fn implicit_expands(query: &UnifiedQuery) -> BTreeSet<String> {
    let mut paths: Vec<String> = query.sort.iter().map(|s| s.field.clone()).collect();
    if let Some(filter) = &query.filters {
        paths.extend(filter.fields());
    }
    paths
        .iter()
        .filter_map(|path| path.split_once('.').map(|(head, _)| head.to_string()))
        .filter(|head| !query.expand.contains_key(head))
        .collect()
}

/// Turn implicitly expanded references back into their ids.
fn collapse(record: &mut Record, fields: &BTreeSet<String>) {
    for field in fields {
        if let Some(Value::Object(expanded)) = record.get(field) {
            let id = expanded.get("id").cloned().unwrap_or(Value::Null);
            record.insert(field.clone(), id);
        }
    }
}

fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn records_from(result: Option<Value>) -> Vec<Record> {
    match result {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(record) => Some(record),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
