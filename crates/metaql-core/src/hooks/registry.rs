use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::Result;

use super::{HookContext, HookEvent, Pattern};

/// Async hook callback. It may mutate the context; an error aborts the
/// remaining hooks and the enclosing operation.
pub type HookHandler = Arc<dyn for<'a> Fn(&'a mut HookContext) -> BoxFuture<'a, Result<()>> + Send + Sync>;

struct Registration {
    id: u64,
    event: Pattern,
    object: Pattern,
    handler: HookHandler,
    package: Option<String>,
}

/// Ordered table of hook registrations.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events matching `event` on objects matching
    /// `object`. Returns an id usable with [`HookRegistry::off`].
    pub fn on<F>(&self, event: impl Into<Pattern>, object: impl Into<Pattern>, handler: F, package: Option<&str>) -> u64
    where
        F: for<'a> Fn(&'a mut HookContext) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let registration = Registration {
            id,
            event: event.into(),
            object: object.into(),
            handler: Arc::new(handler),
            package: package.map(str::to_string),
        };
        debug!(
            id,
            event = %registration.event,
            object = %registration.object,
            package = ?registration.package,
            "hook registered"
        );
        self.hooks.write().push(registration);
        id
    }

    /// Remove one registration.
    pub fn off(&self, id: u64) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|h| h.id != id);
        hooks.len() != before
    }

    /// Remove every hook registered under `package`.
    pub fn remove_package(&self, package: &str) -> usize {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|h| h.package.as_deref() != Some(package));
        let removed = before - hooks.len();
        debug!(package, removed, "hooks removed for package");
        removed
    }

    /// Run all hooks matching `(event, object)` in registration order.
    pub async fn run_hooks(&self, event: HookEvent, object: &str, ctx: &mut HookContext) -> Result<()> {
        let handlers = self.matching(event, object);
        if handlers.is_empty() {
            return Ok(());
        }
        debug!(event = %event, object, count = handlers.len(), "running hooks");
        for (id, handler) in handlers {
            if let Err(err) = handler(&mut *ctx).await {
                warn!(event = %event, object, hook = id, error = %err, "hook failed");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Number of hooks that would run for `(event, object)`.
    pub fn count_matching(&self, event: HookEvent, object: &str) -> usize {
        self.matching(event, object).len()
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matching(&self, event: HookEvent, object: &str) -> Vec<(u64, HookHandler)> {
        self.hooks
            .read()
            .iter()
            .filter(|h| h.event.matches(event.as_str()) && h.object.matches(object))
            .map(|h| (h.id, Arc::clone(&h.handler)))
            .collect()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry").field("hooks", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, HookError};
    use futures::FutureExt;
    use serde_json::{json, Value};

    fn hook<F>(f: F) -> F
    where
        F: for<'a> Fn(&'a mut HookContext) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        f
    }

    fn push(tag: &'static str) -> impl for<'a> Fn(&'a mut HookContext) -> BoxFuture<'a, Result<()>> + Send + Sync {
        hook(move |ctx: &mut HookContext| {
            async move {
                let log = ctx.state.entry("log").or_insert_with(|| json!([]));
                if let Value::Array(items) = log {
                    items.push(json!(tag));
                }
                Ok(())
            }
            .boxed()
        })
    }

    fn log(ctx: &HookContext) -> Value {
        ctx.state.get("log").cloned().unwrap_or(json!([]))
    }

    #[tokio::test]
    async fn test_matching_and_order() {
        let hooks = HookRegistry::new();
        hooks.on("before*", "*", push("any-before"), None);
        hooks.on(HookEvent::BeforeCreate, "account", push("account-create"), None);
        hooks.on("*Create", "acc*", push("acc-create"), None);
        hooks.on(HookEvent::AfterCreate, "account", push("after"), None);

        let mut ctx = HookContext::new(HookEvent::BeforeCreate, "account");
        hooks.run_hooks(HookEvent::BeforeCreate, "account", &mut ctx).await.unwrap();
        assert_eq!(log(&ctx), json!(["any-before", "account-create", "acc-create"]));

        let mut ctx = HookContext::new(HookEvent::BeforeUpdate, "contact");
        hooks.run_hooks(HookEvent::BeforeUpdate, "contact", &mut ctx).await.unwrap();
        assert_eq!(log(&ctx), json!(["any-before"]));
        assert_eq!(hooks.count_matching(HookEvent::AfterDelete, "account"), 0);
    }

    #[tokio::test]
    async fn test_failure_stops_chain() {
        let hooks = HookRegistry::new();
        hooks.on("*", "*", push("first"), None);
        hooks.on(
            "*",
            "*",
            |ctx: &mut HookContext| {
                async move {
                    Err(Error::Hook(HookError::new(ctx.event.as_str(), &ctx.object, "nope")))
                }
                .boxed()
            },
            None,
        );
        hooks.on("*", "*", push("never"), None);

        let mut ctx = HookContext::new(HookEvent::BeforeDelete, "task");
        let err = hooks.run_hooks(HookEvent::BeforeDelete, "task", &mut ctx).await.unwrap_err();
        assert!(matches!(err, Error::Hook(ref e) if e.message == "nope"));
        assert_eq!(log(&ctx), json!(["first"]));
    }

    #[tokio::test]
    async fn test_handlers_mutate_data() {
        let hooks = HookRegistry::new();
        hooks.on(
            HookEvent::BeforeCreate,
            "*",
            |ctx: &mut HookContext| {
                async move {
                    if let Some(data) = ctx.data.as_mut() {
                        data.insert("stamped".into(), json!(true));
                    }
                    Ok(())
                }
                .boxed()
            },
            None,
        );
        let mut ctx = HookContext::new(HookEvent::BeforeCreate, "note").with_data(Default::default());
        hooks.run_hooks(HookEvent::BeforeCreate, "note", &mut ctx).await.unwrap();
        assert_eq!(ctx.data.unwrap()["stamped"], json!(true));
    }

    #[tokio::test]
    async fn test_remove_package_and_off() {
        let hooks = HookRegistry::new();
        hooks.on("*", "account", push("core"), None);
        hooks.on("*", "account", push("crm-1"), Some("crm"));
        let id = hooks.on("*", "account", push("crm-2"), Some("crm"));
        hooks.on("*", "account", push("billing"), Some("billing"));

        assert!(hooks.off(id));
        assert!(!hooks.off(id));
        assert_eq!(hooks.remove_package("crm"), 1);

        let mut ctx = HookContext::new(HookEvent::AfterFind, "account");
        hooks.run_hooks(HookEvent::AfterFind, "account", &mut ctx).await.unwrap();
        assert_eq!(log(&ctx), json!(["core", "billing"]));
    }
}
