//! Reverse-engineering object definitions from an existing database.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::{FieldDefinition, FieldType, ObjectDefinition};

/// Tables reported by a driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntrospectedSchema {
    pub tables: BTreeMap<String, IntrospectedTable>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntrospectedTable {
    #[serde(default)]
    pub columns: Vec<IntrospectedColumn>,
    #[serde(default, alias = "foreign_keys")]
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntrospectedColumn {
    pub name: String,
    /// Native column type, e.g. `varchar(255)`.
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, alias = "is_unique")]
    pub is_unique: bool,
    #[serde(default, alias = "is_primary")]
    pub is_primary: bool,
}

fn default_nullable() -> bool {
    true
}

impl IntrospectedColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            is_unique: false,
            is_primary: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub column_name: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Conversion options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntrospectOptions {
    /// Leave out `system_columns`.
    pub skip_system_columns: bool,
    pub system_columns: Vec<String>,
    /// Tables not converted.
    pub exclude_tables: Vec<String>,
}

impl Default for IntrospectOptions {
    fn default() -> Self {
        Self {
            skip_system_columns: true,
            system_columns: vec!["id".into(), "created_at".into(), "updated_at".into()],
            exclude_tables: Vec::new(),
        }
    }
}

impl IntrospectOptions {
    pub fn with_system_columns(mut self, skip: bool) -> Self {
        self.skip_system_columns = skip;
        self
    }

    pub fn exclude(mut self, table: impl Into<String>) -> Self {
        self.exclude_tables.push(table.into());
        self
    }
}

/// Map a native column type onto a field type.
pub fn map_column_type(native: &str) -> FieldType {
    let lowered = native.trim().to_ascii_lowercase();
    let base = lowered.split('(').next().unwrap_or_default().trim();

    match base {
        "date" => FieldType::Date,
        "datetime" => FieldType::Datetime,
        b if b.starts_with("timestamp") => FieldType::Datetime,
        b if b.starts_with("bool") => FieldType::Boolean,
        b if b.starts_with("json") => FieldType::Json,
        b if b.starts_with("int")
            || b.ends_with("int")
            || b.ends_with("serial")
            || b.starts_with("numeric")
            || b.starts_with("decimal")
            || b.starts_with("float")
            || b.starts_with("real")
            || b.starts_with("double")
            || b == "number" =>
        {
            FieldType::Number
        }
        _ => FieldType::Text,
    }
}

/// Convert introspected tables into object definitions.
///
/// Foreign key columns become lookups on the referenced table.
pub fn to_object_definitions(schema: &IntrospectedSchema, options: &IntrospectOptions) -> Vec<ObjectDefinition> {
    schema
        .tables
        .iter()
        .filter(|(name, _)| !options.exclude_tables.contains(name))
        .map(|(name, table)| table_to_object(name, table, options))
        .collect()
}

fn table_to_object(name: &str, table: &IntrospectedTable, options: &IntrospectOptions) -> ObjectDefinition {
    let mut object = ObjectDefinition::new(name);

    for column in &table.columns {
        if column.is_primary && column.name != "id" {
            object.primary_key = Some(column.name.clone());
        }
        if options.skip_system_columns && options.system_columns.contains(&column.name) {
            continue;
        }

        let foreign_key = table.foreign_keys.iter().find(|fk| fk.column_name == column.name);
        let mut field = match foreign_key {
            Some(fk) => FieldDefinition::lookup(fk.referenced_table.clone()),
            None => FieldDefinition::new(map_column_type(&column.data_type)),
        };
        field.required = !column.nullable && !column.is_primary;
        field.unique = column.is_unique;
        object = object.with_field(column.name.clone(), field);
    }

    object
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_mapping() {
        assert_eq!(map_column_type("varchar(255)"), FieldType::Text);
        assert_eq!(map_column_type("INTEGER"), FieldType::Number);
        assert_eq!(map_column_type("bigint"), FieldType::Number);
        assert_eq!(map_column_type("bigserial"), FieldType::Number);
        assert_eq!(map_column_type("numeric(10,2)"), FieldType::Number);
        assert_eq!(map_column_type("double precision"), FieldType::Number);
        assert_eq!(map_column_type("boolean"), FieldType::Boolean);
        assert_eq!(map_column_type("date"), FieldType::Date);
        assert_eq!(map_column_type("timestamp with time zone"), FieldType::Datetime);
        assert_eq!(map_column_type("jsonb"), FieldType::Json);
        assert_eq!(map_column_type("uuid"), FieldType::Text);
    }

    #[test]
    fn test_foreign_keys_become_lookups() {
        let schema: IntrospectedSchema = serde_json::from_value(json!({
            "tables": {
                "contact": {
                    "columns": [
                        {"name": "id", "type": "uuid", "nullable": false, "isPrimary": true},
                        {"name": "email", "type": "varchar(255)", "nullable": false, "isUnique": true},
                        {"name": "account_id", "type": "uuid"},
                        {"name": "created_at", "type": "timestamp"}
                    ],
                    "foreignKeys": [
                        {"columnName": "account_id", "referencedTable": "account", "referencedColumn": "id"}
                    ]
                },
                "migrations": {"columns": []}
            }
        }))
        .unwrap();

        let objects = to_object_definitions(&schema, &IntrospectOptions::default().exclude("migrations"));
        assert_eq!(objects.len(), 1);

        let contact = &objects[0];
        assert_eq!(contact.name, "contact");
        assert!(!contact.has_field("created_at"));
        assert!(contact.fields["email"].required);
        assert!(contact.fields["email"].unique);

        let account = &contact.fields["account_id"];
        assert_eq!(account.field_type, FieldType::Lookup);
        assert_eq!(account.reference_to.as_deref(), Some("account"));
    }

    #[test]
    fn test_keep_system_columns() {
        let mut schema = IntrospectedSchema::default();
        schema.tables.insert(
            "note".into(),
            IntrospectedTable {
                columns: vec![
                    IntrospectedColumn::new("id", "int").primary(),
                    IntrospectedColumn::new("updated_at", "timestamp").not_null(),
                ],
                foreign_keys: vec![],
            },
        );
        let objects = to_object_definitions(&schema, &IntrospectOptions::default().with_system_columns(false));
        let note = &objects[0];
        assert!(note.has_field("updated_at"));
        assert!(note.fields["updated_at"].required);
        assert!(!note.fields["id"].required);
    }
}
