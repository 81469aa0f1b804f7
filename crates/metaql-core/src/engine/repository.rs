use metaql_proto::{Filter, Record, UnifiedQuery, Value};

use crate::error::Result;

use super::{Context, Engine};

/// Engine operations bound to one object and caller context.
#[derive(Debug, Clone)]
pub struct Repository {
    engine: Engine,
    object: String,
    ctx: Context,
}

impl Repository {
    pub(crate) fn new(engine: Engine, object: String, ctx: Context) -> Self {
        Self { engine, object, ctx }
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub async fn find(&self, query: UnifiedQuery) -> Result<Vec<Record>> {
        self.engine.find(&self.object, query, &self.ctx).await
    }

    pub async fn find_one(&self, id: &str) -> Result<Option<Record>> {
        self.engine.find_one(&self.object, id, &self.ctx).await
    }

    pub async fn count(&self, filter: Option<Filter>) -> Result<usize> {
        self.engine.count(&self.object, filter, &self.ctx).await
    }

    pub async fn aggregate(&self, query: UnifiedQuery) -> Result<Vec<Record>> {
        self.engine.aggregate(&self.object, query, &self.ctx).await
    }

    pub async fn create(&self, data: Record) -> Result<Record> {
        self.engine.create(&self.object, data, &self.ctx).await
    }

    pub async fn update(&self, id: &str, data: Record) -> Result<Record> {
        self.engine.update(&self.object, id, data, &self.ctx).await
    }

    pub async fn delete(&self, id: &str) -> Result<Record> {
        self.engine.delete(&self.object, id, &self.ctx).await
    }

    /// Run an action on this object, optionally scoped to one record.
    pub async fn execute_action(&self, name: &str, record_id: Option<&str>, params: Value) -> Result<Value> {
        self.engine
            .execute_action(&self.object, name, record_id, params, &self.ctx)
            .await
    }
}
