//! Engine facade.
//!
//! [`Engine`] owns one instance of every shared component (registry,
//! dependency graph, plan cache, pool, hooks, actions) and runs CRUD
//! operations through them in a fixed order: hooks, validation, formula
//! handling, driver call.

mod context;
mod read;
mod repository;
mod write;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use metaql_formula::FormulaEngine;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::catalog::{MetadataRegistry, ObjectDefinition};
use crate::config::EngineConfig;
use crate::driver::{Driver, DriverOptions};
use crate::error::{Error, Result, SchemaError};
use crate::graph::DependencyGraph;
use crate::hooks::{ActionRegistry, HookRegistry};
use crate::introspect::{to_object_definitions, IntrospectOptions};
use crate::pool::ConnectionPool;
use crate::query::QueryCompiler;
use crate::validation::ValidationEngine;

pub use context::Context;
pub use repository::Repository;

/// Shared handle to an engine instance. Cloning is cheap.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    registry: Arc<MetadataRegistry>,
    /// Graph and the registry version it was built from.
    graph: RwLock<(u64, Arc<DependencyGraph>)>,
    compiler: QueryCompiler,
    formulas: Arc<FormulaEngine>,
    validation: ValidationEngine,
    pool: Arc<ConnectionPool>,
    hooks: HookRegistry,
    actions: ActionRegistry,
    datasources: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

impl Engine {
    /// Create an engine with an empty registry.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_registry(config, Arc::new(MetadataRegistry::new()))
    }

    /// Create an engine over an existing registry.
    pub fn with_registry(config: EngineConfig, registry: Arc<MetadataRegistry>) -> Result<Self> {
        config.validate()?;
        let formulas = Arc::new(FormulaEngine::new());
        let inner = EngineInner {
            compiler: QueryCompiler::new(Arc::clone(&registry), config.plan_cache_capacity),
            validation: ValidationEngine::new(Arc::clone(&formulas), config.validation.clone()),
            pool: Arc::new(ConnectionPool::new(config.pool.clone())),
            graph: RwLock::new((u64::MAX, Arc::new(DependencyGraph::new()))),
            hooks: HookRegistry::new(),
            actions: ActionRegistry::new(),
            datasources: RwLock::new(HashMap::new()),
            formulas,
            registry,
            config,
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.inner.registry
    }

    pub fn compiler(&self) -> &QueryCompiler {
        &self.inner.compiler
    }

    pub fn formulas(&self) -> &Arc<FormulaEngine> {
        &self.inner.formulas
    }

    pub fn validation(&self) -> &ValidationEngine {
        &self.inner.validation
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.inner.actions
    }

    /// Register a driver under a datasource name.
    pub fn register_datasource(&self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        let name = name.into();
        info!(datasource = %name, driver = driver.name(), kind = %driver.kind(), "datasource registered");
        self.inner.datasources.write().insert(name, driver);
    }

    pub fn datasource(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.inner
            .datasources
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownDatasource(name.to_string()).into())
    }

    /// Register an object definition.
    pub fn register_object(&self, object: ObjectDefinition, package: Option<&str>) -> Result<()> {
        Ok(self.inner.registry.register_object(object, package)?)
    }

    /// Remove metadata, hooks and actions registered under `package`.
    pub fn unregister_package(&self, package: &str) -> usize {
        let entries = self.inner.registry.unregister_package(package);
        let hooks = self.inner.hooks.remove_package(package);
        let actions = self.inner.actions.remove_package(package);
        info!(package, entries, hooks, actions, "package unregistered");
        entries + hooks + actions
    }

    /// Repository bound to one object and caller context.
    pub fn repository(&self, object: impl Into<String>, ctx: Context) -> Repository {
        Repository::new(self.clone(), object.into(), ctx)
    }

    /// Dependency graph for the current registry contents.
    pub fn graph(&self) -> Arc<DependencyGraph> {
        let version = self.inner.registry.version();
        {
            let current = self.inner.graph.read();
            if current.0 == version {
                return Arc::clone(&current.1);
            }
        }
        let objects = self.inner.registry.objects();
        let graph = Arc::new(DependencyGraph::from_objects(objects.iter().map(Arc::as_ref)));
        if graph.has_circular_dependency() {
            warn!(version, "master_detail references form a cycle");
        }
        debug!(version, objects = objects.len(), edges = graph.edges().len(), "dependency graph rebuilt");
        *self.inner.graph.write() = (version, Arc::clone(&graph));
        graph
    }

    /// Run `work` inside a transaction on `datasource`.
    ///
    /// The transaction holds one pool slot until it ends. It commits when
    /// `work` succeeds and rolls back when it fails; the failure is then
    /// returned as [`Error::Transaction`] wrapping the cause. On a driver
    /// without transactions `work` runs with no handle and its error is
    /// returned unchanged.
    pub async fn transaction<T, F, Fut>(&self, datasource: &str, ctx: &Context, work: F) -> Result<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(current) = ctx.transaction_datasource() {
            if current == datasource {
                return work(ctx.clone()).await;
            }
            return Err(Error::transaction(
                format!("already in a transaction on '{current}'"),
                None,
            ));
        }

        let driver = self.datasource(datasource)?;
        let _slot = self.inner.pool.acquire_guard(datasource).await?;
        let handle = driver.begin_transaction().await?;
        match &handle {
            Some(handle) => debug!(datasource, transaction = %handle, "transaction started"),
            None => debug!(datasource, "driver has no transactions, running without one"),
        }

        let outcome = work(ctx.clone().in_scope(datasource, handle.clone())).await;
        let Some(handle) = handle else {
            return outcome;
        };

        match outcome {
            Ok(value) => {
                if let Err(err) = driver.commit_transaction(&handle).await {
                    warn!(datasource, transaction = %handle, error = %err, "commit failed, rolling back");
                    if let Err(rollback) = driver.rollback_transaction(&handle).await {
                        warn!(datasource, transaction = %handle, error = %rollback, "rollback failed");
                    }
                    return Err(Error::transaction("commit failed", Some(err.into())));
                }
                debug!(datasource, transaction = %handle, "transaction committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = driver.rollback_transaction(&handle).await {
                    warn!(datasource, transaction = %handle, error = %rollback, "rollback failed");
                }
                debug!(datasource, transaction = %handle, error = %err, "transaction rolled back");
                Err(Error::transaction("transaction rolled back", Some(err)))
            }
        }
    }

    /// Introspect a datasource and register an object per table. Returns
    /// the registered object names.
    pub async fn import_schema(
        &self,
        datasource: &str,
        package: Option<&str>,
        options: &IntrospectOptions,
    ) -> Result<Vec<String>> {
        let driver = self.datasource(datasource)?;
        let schema = {
            let _slot = self.inner.pool.acquire_guard(datasource).await?;
            driver.introspect_schema().await?
        };
        let mut names = Vec::new();
        for object in to_object_definitions(&schema, options) {
            let object = object.with_datasource(datasource);
            names.push(object.name.clone());
            self.register_object(object, package)?;
        }
        info!(datasource, objects = names.len(), "schema imported");
        Ok(names)
    }

    /// Disconnect every registered driver.
    pub async fn shutdown(&self) -> Result<()> {
        let drivers: Vec<(String, Arc<dyn Driver>)> = self
            .inner
            .datasources
            .read()
            .iter()
            .map(|(name, driver)| (name.clone(), Arc::clone(driver)))
            .collect();
        for (name, driver) in drivers {
            debug!(datasource = %name, "disconnecting");
            driver.disconnect().await?;
        }
        self.inner.pool.close_idle();
        Ok(())
    }

    fn object(&self, name: &str) -> Result<Arc<ObjectDefinition>> {
        Ok(self.inner.registry.require_object(name)?)
    }

    fn datasource_name<'a>(&'a self, object: &'a ObjectDefinition) -> &'a str {
        object
            .datasource
            .as_deref()
            .unwrap_or(&self.inner.config.default_datasource)
    }

    /// Run `work` against the driver of `datasource` while holding a pool
    /// slot, unless the context's transaction already holds one.
    async fn with_driver<T, F, Fut>(&self, datasource: &str, ctx: &Context, work: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Driver>, DriverOptions) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let driver = self.datasource(datasource)?;
        let opts = DriverOptions::new().with_transaction(ctx.handle_for(datasource));
        if ctx.holds(datasource) {
            return work(driver, opts).await;
        }
        let _slot = self.inner.pool.acquire_guard(datasource).await?;
        work(driver, opts).await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("objects", &self.inner.registry.objects().len())
            .field("datasources", &self.inner.datasources.read().len())
            .finish()
    }
}
