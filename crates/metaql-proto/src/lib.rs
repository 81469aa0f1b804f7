//! metaql query IR.
//!
//! This crate defines the declarative, JSON-serializable description of
//! reads against a metadata-defined schema.
//!
//! # Modules
//!
//! - [`record`] - Record type and path helpers
//! - [`value`] - Comparison semantics shared by filters and validation
//! - [`filter`] - Filter AST in array and object-keyed forms
//! - [`query`] - Unified query, sort, expand and aggregation specs
//! - [`error`] - IR error types
//!
//! # Example
//!
//! ```
//! use metaql_proto::{Filter, UnifiedQuery};
//! use serde_json::json;
//!
//! let query: UnifiedQuery = serde_json::from_value(json!({
//!     "object": "project",
//!     "filters": [["status", "=", "open"], "or", ["budget", ">", 1000]],
//!     "top": 10
//! }))
//! .unwrap();
//!
//! assert_eq!(query.object, "project");
//! assert!(matches!(query.filters, Some(Filter::Or(_))));
//! ```

pub mod error;
pub mod filter;
pub mod query;
pub mod record;
pub mod value;

pub use error::Error;
pub use filter::{Condition, Filter, FilterOperator};
pub use query::{
    AggregateFunction, Aggregation, ExpandSpec, SortDirection, SortSpec, UnifiedQuery,
};
pub use record::{get_path, merge_records, record_id, Record};
pub use value::{compare_values, is_blank, values_equal};

/// Re-export of the JSON value type used for every literal and field value.
pub use serde_json::Value;
