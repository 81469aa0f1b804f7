use std::collections::HashSet;
use std::sync::Arc;

use metaql_proto::{record_id, Filter, Record, UnifiedQuery, Value};
use tracing::{debug, info};

use crate::catalog::ObjectDefinition;
use crate::driver::{Driver, DriverOptions};
use crate::error::{Error, Result};
use crate::hooks::{ActionContext, HookContext, HookEvent};
use crate::validation::{field_rules, Operation, UniquenessProbe, ValidationContext, ValidationRule};

use super::{Context, Engine};

/// Uniqueness checks against the driver that is about to take the write.
struct DriverProbe<'a> {
    driver: &'a dyn Driver,
    table: &'a str,
    opts: &'a DriverOptions,
}

#[async_trait::async_trait]
impl UniquenessProbe for DriverProbe<'_> {
    async fn exists(&self, _object: &str, filter: &Filter, exclude_id: Option<&str>) -> Result<bool> {
        let query = UnifiedQuery::new(self.table).with_filter(filter.clone()).with_top(2);
        let rows = self.driver.find(self.table, &query, self.opts).await?;
        Ok(rows
            .iter()
            .any(|row| exclude_id.is_none() || record_id(row).as_deref() != exclude_id))
    }
}

impl Engine {
    /// Create a record.
    ///
    /// Formula fields in `data` are dropped and defaults fill absent fields
    /// before validation. Returns the stored record with formulas computed.
    pub async fn create(&self, object: &str, data: Record, ctx: &Context) -> Result<Record> {
        let def = self.object(object)?;

        let mut hook_ctx = HookContext::new(HookEvent::BeforeCreate, object)
            .with_data(data)
            .with_user(ctx.user.clone())
            .with_transaction(ctx.transaction_handle().cloned());
        self.inner
            .hooks
            .run_hooks(HookEvent::BeforeCreate, object, &mut hook_ctx)
            .await?;

        let mut data = strip_formulas(&def, hook_ctx.data.take().unwrap_or_default());
        for field in def.fields.values() {
            if let Some(default) = &field.default_value {
                if !field.is_formula() && !data.contains_key(&field.name) {
                    data.insert(field.name.clone(), default.clone());
                }
            }
        }

        let rules = self.rules(&def);
        let mut created = self
            .with_driver(self.datasource_name(&def), ctx, |driver, opts| {
                let (def, data, rules) = (&def, data, &rules);
                async move {
                    let probe = DriverProbe {
                        driver: driver.as_ref(),
                        table: def.table_name(),
                        opts: &opts,
                    };
                    let mut vctx = ValidationContext::new(&def.name, &data, Operation::Create).with_uniqueness(&probe);
                    if let Some(user) = ctx.user.as_ref() {
                        vctx = vctx.with_user(user);
                    }
                    self.check(rules, &vctx).await?;
                    Ok(driver.create(def.table_name(), data, &opts).await?)
                }
            })
            .await?;

        let formulas = self.formula_order(&def, None);
        self.apply_formulas(&def, &formulas, std::slice::from_mut(&mut created), true, ctx)
            .await?;
        info!(object, id = ?record_id(&created), "record created");

        let mut hook_ctx = hook_ctx.into_after(Value::Object(created));
        self.inner
            .hooks
            .run_hooks(HookEvent::AfterCreate, object, &mut hook_ctx)
            .await?;
        Ok(into_record(hook_ctx.result))
    }

    /// Apply a partial update to a record.
    pub async fn update(&self, object: &str, id: &str, data: Record, ctx: &Context) -> Result<Record> {
        let def = self.object(object)?;
        let previous = self.require_record(&def, id, ctx).await?;

        let mut hook_ctx = HookContext::new(HookEvent::BeforeUpdate, object)
            .with_id(id)
            .with_data(data)
            .with_previous(previous.clone())
            .with_user(ctx.user.clone())
            .with_transaction(ctx.transaction_handle().cloned());
        self.inner
            .hooks
            .run_hooks(HookEvent::BeforeUpdate, object, &mut hook_ctx)
            .await?;

        let data = strip_formulas(&def, hook_ctx.data.take().unwrap_or_default());
        let rules = self.rules(&def);
        let mut updated = self
            .with_driver(self.datasource_name(&def), ctx, |driver, opts| {
                let (def, data, rules, previous) = (&def, data, &rules, &previous);
                async move {
                    let probe = DriverProbe {
                        driver: driver.as_ref(),
                        table: def.table_name(),
                        opts: &opts,
                    };
                    let mut vctx = ValidationContext::new(&def.name, &data, Operation::Update)
                        .with_previous(previous)
                        .with_record_id(id)
                        .with_uniqueness(&probe);
                    if let Some(user) = ctx.user.as_ref() {
                        vctx = vctx.with_user(user);
                    }
                    self.check(rules, &vctx).await?;
                    Ok(driver.update(def.table_name(), id, data, &opts).await?)
                }
            })
            .await?;

        let formulas = self.formula_order(&def, None);
        self.apply_formulas(&def, &formulas, std::slice::from_mut(&mut updated), false, ctx)
            .await?;
        info!(object, id, "record updated");

        let mut hook_ctx = hook_ctx.into_after(Value::Object(updated));
        self.inner
            .hooks
            .run_hooks(HookEvent::AfterUpdate, object, &mut hook_ctx)
            .await?;
        Ok(into_record(hook_ctx.result))
    }

    /// Delete a record and its master_detail children.
    ///
    /// Children are deleted before their parents, following the dependency
    /// graph's cascade order. Outside a transaction the cascade runs in one
    /// on the root's datasource, so a failed delete leaves every row in
    /// place where the driver supports transactions. Returns the deleted
    /// root record.
    pub async fn delete(&self, object: &str, id: &str, ctx: &Context) -> Result<Record> {
        let def = self.object(object)?;
        let previous = self.require_record(&def, id, ctx).await?;

        let mut hook_ctx = HookContext::new(HookEvent::BeforeDelete, object)
            .with_id(id)
            .with_previous(previous.clone())
            .with_user(ctx.user.clone())
            .with_transaction(ctx.transaction_handle().cloned());
        self.inner
            .hooks
            .run_hooks(HookEvent::BeforeDelete, object, &mut hook_ctx)
            .await?;

        let rules = self.rules(&def);
        let empty = Record::new();
        let mut vctx = ValidationContext::new(&def.name, &empty, Operation::Delete)
            .with_previous(&previous)
            .with_record_id(id);
        if let Some(user) = ctx.user.as_ref() {
            vctx = vctx.with_user(user);
        }
        self.check(&rules, &vctx).await?;

        let order = self.graph().get_cascade_delete_order(object)?;
        let mut children = self.cascade_children(&def, id, ctx).await?;
        children.sort_by_key(|(child, _)| order.iter().position(|name| *name == child.name));
        if !children.is_empty() {
            debug!(object, order = ?order, rows = children.len(), "cascade delete");
        }

        let deleted = if children.is_empty() || ctx.in_transaction() {
            self.delete_rows(&def, id, &children, ctx).await?
        } else {
            let (def, children) = (&def, &children);
            self.transaction(self.datasource_name(def), ctx, |tx| async move {
                self.delete_rows(def, id, children, &tx).await
            })
            .await?
        };
        info!(object, id, cascaded = children.len(), "record deleted");

        let mut hook_ctx = hook_ctx.into_after(Value::Object(deleted));
        self.inner
            .hooks
            .run_hooks(HookEvent::AfterDelete, object, &mut hook_ctx)
            .await?;
        Ok(into_record(hook_ctx.result))
    }

    /// Delete `children` in the given order, then the root record.
    async fn delete_rows(
        &self,
        def: &ObjectDefinition,
        id: &str,
        children: &[(Arc<ObjectDefinition>, String)],
        ctx: &Context,
    ) -> Result<Record> {
        for (child, child_id) in children {
            let table = child.table_name();
            self.with_driver(self.datasource_name(child), ctx, |driver, opts| async move {
                Ok(driver.delete(table, child_id, &opts).await?)
            })
            .await?;
            debug!(object = %child.name, id = %child_id, parent = %def.name, "cascade deleted");
        }

        let table = def.table_name();
        self.with_driver(self.datasource_name(def), ctx, |driver, opts| async move {
            Ok(driver.delete(table, id, &opts).await?)
        })
        .await
    }

    /// Run a registered action. The target record is loaded when `record_id`
    /// names one on a registered object.
    pub async fn execute_action(
        &self,
        object: &str,
        name: &str,
        record_id: Option<&str>,
        params: Value,
        ctx: &Context,
    ) -> Result<Value> {
        let mut action = ActionContext::new(object, name)
            .with_params(params)
            .with_user(ctx.user.clone());
        action.transaction = ctx.transaction_handle().cloned();

        if let Some(id) = record_id {
            action = action.with_record_id(id);
            if let Some(def) = self.inner.registry.get_object(object) {
                action.record = self.fetch_by_id(&def, id, ctx).await?;
            }
        }
        self.inner.actions.execute_action(object, name, action).await
    }

    /// Field-implied rules followed by declared rules.
    fn rules(&self, def: &ObjectDefinition) -> Vec<ValidationRule> {
        let mut rules = field_rules(def);
        rules.extend(self.inner.registry.rules_for(&def.name));
        rules
    }

    async fn check(&self, rules: &[ValidationRule], vctx: &ValidationContext<'_>) -> Result<()> {
        let warnings = self
            .inner
            .validation
            .validate(rules, vctx)
            .await?
            .into_result(vctx.object)?;
        for warning in &warnings {
            debug!(object = vctx.object, rule = %warning.rule, message = %warning.message, "validation warning");
        }
        Ok(())
    }

    async fn require_record(&self, def: &ObjectDefinition, id: &str, ctx: &Context) -> Result<Record> {
        self.fetch_by_id(def, id, ctx).await?.ok_or_else(|| Error::NotFound {
            object: def.name.clone(),
            id: id.to_string(),
        })
    }

    /// Every record owned through master_detail references, in discovery
    /// order.
    async fn cascade_children(
        &self,
        def: &ObjectDefinition,
        id: &str,
        ctx: &Context,
    ) -> Result<Vec<(Arc<ObjectDefinition>, String)>> {
        let graph = self.graph();
        let mut found = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut stack = vec![(def.name.clone(), id.to_string())];

        while let Some((parent, parent_id)) = stack.pop() {
            for edge in graph.get_dependents(&parent).into_iter().filter(|e| e.is_cascade()) {
                let child = self.object(&edge.from)?;
                let query = UnifiedQuery::new(&child.name).with_filter(Filter::eq(edge.via_field.clone(), parent_id.clone()));
                let rows = self.fetch_rows(&child, &query, ctx).await?;
                for row in rows {
                    let Some(child_id) = record_id(&row) else {
                        continue;
                    };
                    if seen.insert((child.name.clone(), child_id.clone())) {
                        stack.push((child.name.clone(), child_id.clone()));
                        found.push((Arc::clone(&child), child_id));
                    }
                }
            }
        }
        Ok(found)
    }
}

fn strip_formulas(def: &ObjectDefinition, mut data: Record) -> Record {
    data.retain(|key, _| !def.field(key).map(|f| f.is_formula()).unwrap_or(false));
    data
}

fn into_record(result: Option<Value>) -> Record {
    match result {
        Some(Value::Object(record)) => record,
        _ => Record::new(),
    }
}
