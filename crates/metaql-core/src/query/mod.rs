//! Query compilation and in-process execution.
//!
//! - [`compiler`]: plan building, index hints and join tightening
//! - [`cache`]: structural fingerprints and the LRU plan cache
//! - [`filter`]: filter evaluation against a record
//! - [`executor`] / [`aggregate`]: scans for drivers without a query language

pub mod aggregate;
pub mod cache;
pub mod compiler;
pub mod executor;
pub mod filter;

pub use aggregate::aggregate_records;
pub use cache::{CacheStats, PlanCache, QueryFingerprint};
pub use compiler::{CompiledQuery, Join, JoinKind, QueryCompiler, QueryPlan};
pub use executor::run_query;
pub use filter::matches;
