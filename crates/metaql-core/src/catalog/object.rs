//! Object and field definitions.

use std::collections::BTreeMap;

use metaql_formula::FormulaType;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::validation::ValidationRule;

/// Name of the primary key field when an object does not declare one.
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// Field data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Text,
    Textarea,
    Number,
    Integer,
    Currency,
    Percent,
    Boolean,
    Date,
    Datetime,
    Email,
    Url,
    Select,
    /// Reference to another object.
    Lookup,
    /// Owned reference; deleting the parent cascades to this object.
    MasterDetail,
    /// Computed on read from `formula`.
    Formula,
    Json,
    /// Unrecognized type name; treated as opaque.
    #[serde(other)]
    Other,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Textarea => "textarea",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Currency => "currency",
            FieldType::Percent => "percent",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Email => "email",
            FieldType::Url => "url",
            FieldType::Select => "select",
            FieldType::Lookup => "lookup",
            FieldType::MasterDetail => "master_detail",
            FieldType::Formula => "formula",
            FieldType::Json => "json",
            FieldType::Other => "other",
        }
    }

    /// Whether the field points at another object.
    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Lookup | FieldType::MasterDetail)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Number | FieldType::Integer | FieldType::Currency | FieldType::Percent
        )
    }
}

/// Text formats checked by implicit field rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldFormat {
    Email,
    Url,
}

/// Declarative constraints on a single field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "minLength")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "maxLength")]
    pub max_length: Option<usize>,
    /// Regular expression the whole value must match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<FieldFormat>,
}

impl FieldConstraints {
    pub fn is_empty(&self) -> bool {
        *self == FieldConstraints::default()
    }
}

/// A field of an object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldDefinition {
    /// Field name; filled from the map key on registration when absent.
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub required: bool,
    pub unique: bool,
    pub index: bool,
    #[serde(skip_serializing_if = "Option::is_none", alias = "defaultValue")]
    pub default_value: Option<Json>,
    /// Expression computing this field on read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    /// Result type of `formula`; derived from the field type when absent.
    #[serde(skip_serializing_if = "Option::is_none", alias = "returnType")]
    pub return_type: Option<FormulaType>,
    /// Target object of a lookup/master_detail field.
    #[serde(skip_serializing_if = "Option::is_none", alias = "referenceTo", alias = "reference")]
    pub reference_to: Option<String>,
    /// Allowed values of a select field.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Json>,
    #[serde(skip_serializing_if = "FieldConstraints::is_empty")]
    pub validation: FieldConstraints,
}

impl FieldDefinition {
    /// Create a field of the given type.
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            ..Default::default()
        }
    }

    pub fn text() -> Self {
        Self::new(FieldType::Text)
    }

    pub fn number() -> Self {
        Self::new(FieldType::Number)
    }

    pub fn date() -> Self {
        Self::new(FieldType::Date)
    }

    /// Lookup reference to another object.
    pub fn lookup(target: impl Into<String>) -> Self {
        Self {
            field_type: FieldType::Lookup,
            reference_to: Some(target.into()),
            ..Default::default()
        }
    }

    /// Owned reference; the parent's deletion cascades here.
    pub fn master_detail(target: impl Into<String>) -> Self {
        Self {
            field_type: FieldType::MasterDetail,
            reference_to: Some(target.into()),
            ..Default::default()
        }
    }

    /// Computed field with a declared result type.
    pub fn formula(expression: impl Into<String>, return_type: FormulaType) -> Self {
        Self {
            field_type: FieldType::Formula,
            formula: Some(expression.into()),
            return_type: Some(return_type),
            ..Default::default()
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn with_default(mut self, value: Json) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_formula(mut self, expression: impl Into<String>) -> Self {
        self.formula = Some(expression.into());
        self
    }

    pub fn with_constraints(mut self, constraints: FieldConstraints) -> Self {
        self.validation = constraints;
        self
    }

    pub fn with_options(mut self, options: Vec<Json>) -> Self {
        self.options = options;
        self
    }

    /// Whether the value is computed rather than stored.
    pub fn is_formula(&self) -> bool {
        self.formula.is_some()
    }

    /// Result type used when coercing the formula value.
    pub fn formula_type(&self) -> FormulaType {
        self.return_type
            .unwrap_or_else(|| FormulaType::from_field_type(self.field_type.as_str()))
    }

    /// Effective text format, including the one implied by the type.
    pub fn format(&self) -> Option<FieldFormat> {
        self.validation.format.or(match self.field_type {
            FieldType::Email => Some(FieldFormat::Email),
            FieldType::Url => Some(FieldFormat::Url),
            _ => None,
        })
    }
}

/// A secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    pub fn on<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: None,
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Declared custom operation on an object. Handlers are registered
/// separately with the action registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Parameter schema, opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Json>,
}

/// Kind of an inter-object reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Lookup,
    MasterDetail,
}

/// A reference from one of this object's fields to another object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference<'a> {
    pub field: &'a str,
    pub target: &'a str,
    pub kind: ReferenceKind,
}

/// A named schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectDefinition {
    /// Object name; filled from the entry id on registration when absent.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Datasource storing this object; the engine default when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasource: Option<String>,
    /// Backing table/collection name; the object name when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(alias = "primaryKey")]
    pub primary_key: Option<String>,
    pub fields: BTreeMap<String, FieldDefinition>,
    #[serde(alias = "validations", alias = "validation_rules", skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ValidationRule>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDefinition>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionDefinition>,
}

impl ObjectDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, mut field: FieldDefinition) -> Self {
        let name = name.into();
        field.name = name.clone();
        self.fields.insert(name, field);
        self
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_datasource(mut self, datasource: impl Into<String>) -> Self {
        self.datasource = Some(datasource.into());
        self
    }

    pub fn with_action(mut self, action: ActionDefinition) -> Self {
        self.actions.push(action);
        self
    }

    /// Fill derived names: the object name from `id` and every field name
    /// from its map key.
    pub fn normalize(&mut self, id: &str) {
        if self.name.is_empty() {
            self.name = id.to_string();
        }
        for (key, field) in self.fields.iter_mut() {
            if field.name.is_empty() {
                field.name = key.clone();
            }
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.get(name)
    }

    pub fn primary_key(&self) -> &str {
        self.primary_key.as_deref().unwrap_or(DEFAULT_PRIMARY_KEY)
    }

    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }

    /// Whether a field is a known field or the primary key.
    pub fn has_field(&self, name: &str) -> bool {
        name == self.primary_key() || self.fields.contains_key(name)
    }

    /// Whether lookups on `field` can use an index: the primary key, a
    /// field flagged `index`/`unique`, or the leading column of an index.
    pub fn is_indexed(&self, field: &str) -> bool {
        if field == self.primary_key() {
            return true;
        }
        if let Some(def) = self.fields.get(field) {
            if def.index || def.unique {
                return true;
            }
        }
        self.indexes
            .iter()
            .any(|index| index.fields.first().map(String::as_str) == Some(field))
    }

    /// Fields that must be unique, from field flags and unique indexes.
    pub fn unique_field_sets(&self) -> Vec<Vec<String>> {
        let mut sets: Vec<Vec<String>> = self
            .fields
            .values()
            .filter(|f| f.unique)
            .map(|f| vec![f.name.clone()])
            .collect();
        for index in self.indexes.iter().filter(|i| i.unique) {
            if !sets.contains(&index.fields) {
                sets.push(index.fields.clone());
            }
        }
        sets
    }

    /// Lookup and master_detail references.
    pub fn references(&self) -> impl Iterator<Item = Reference<'_>> {
        self.fields.values().filter_map(|field| {
            let kind = match field.field_type {
                FieldType::Lookup => ReferenceKind::Lookup,
                FieldType::MasterDetail => ReferenceKind::MasterDetail,
                _ => return None,
            };
            field.reference_to.as_deref().map(|target| Reference {
                field: field.name.as_str(),
                target,
                kind,
            })
        })
    }

    /// Computed fields.
    pub fn formula_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.values().filter(|f| f.is_formula())
    }
}
