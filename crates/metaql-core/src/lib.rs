//! metaql core - metadata-driven data access.
//!
//! Objects are described at runtime as metadata and every read and write
//! goes through one [`Engine`]:
//!
//! - [`catalog`] - object/field definitions and the metadata registry
//! - [`graph`] - dependency graph over lookup and master_detail references
//! - [`validation`] - rule evaluation with aggregated failures
//! - [`query`] - query compilation and the LRU plan cache
//! - [`pool`] - per-driver and global connection limits with FIFO waiters
//! - [`hooks`] - lifecycle hooks and named actions
//! - [`driver`] - the driver contract plus the memory and sled drivers
//! - [`engine`] - the facade tying it together
//!
//! Formula evaluation lives in `metaql-formula` and the query IR in
//! `metaql-proto`, re-exported here as [`formula`] and [`proto`].

pub mod catalog;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hooks;
pub mod introspect;
pub mod pool;
pub mod query;
pub mod validation;

pub use catalog::{FieldDefinition, FieldType, MetadataEntry, MetadataKind, MetadataRegistry, ObjectDefinition, ReferenceKind};
pub use config::{EngineConfig, PoolConfig, ValidationConfig};
pub use driver::{Driver, DriverKind, DriverOptions, MemoryDriver, SledDriver, TransactionHandle};
pub use engine::{Context, Engine, Repository};
pub use error::{DriverError, Error, ErrorKind, GraphError, HookError, PoolError, Result, SchemaError, ValidationError};
pub use graph::{DependencyEdge, DependencyGraph};
pub use hooks::{ActionContext, ActionRegistry, HookContext, HookEvent, HookRegistry};
pub use introspect::{IntrospectOptions, IntrospectedSchema};
pub use pool::{ConnectionHandle, ConnectionPool, PoolStats, PooledConnection};
pub use query::{CompiledQuery, PlanCache, QueryCompiler, QueryFingerprint};
pub use validation::{Operation, Severity, ValidationEngine, ValidationRule};

/// Re-export of the query IR.
pub use metaql_proto as proto;
/// Re-export of the formula engine.
pub use metaql_formula as formula;
