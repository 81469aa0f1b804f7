//! Metadata catalog.
//!
//! Object and field definitions plus the registry that stores them.

mod object;
mod registry;

pub use object::{
    ActionDefinition, FieldConstraints, FieldDefinition, FieldFormat, FieldType, IndexDefinition,
    ObjectDefinition, Reference, ReferenceKind, DEFAULT_PRIMARY_KEY,
};
pub use registry::{MetadataEntry, MetadataKind, MetadataRegistry};
