//! Metadata registry.
//!
//! Stores every metadata entry keyed by `(type, id)`, keeps a secondary
//! index from package name to the keys that package contributed, and
//! caches parsed object definitions and standalone validation rules.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::error::SchemaError;
use crate::validation::ValidationRule;

use super::object::ObjectDefinition;

/// Metadata entry type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetadataKind {
    Object,
    Validation,
    Hook,
    Action,
    Data,
    /// Any other type, stored verbatim.
    Other(String),
}

impl MetadataKind {
    pub fn as_str(&self) -> &str {
        match self {
            MetadataKind::Object => "object",
            MetadataKind::Validation => "validation",
            MetadataKind::Hook => "hook",
            MetadataKind::Action => "action",
            MetadataKind::Data => "data",
            MetadataKind::Other(name) => name,
        }
    }
}

impl From<&str> for MetadataKind {
    fn from(name: &str) -> Self {
        match name {
            "object" => MetadataKind::Object,
            "validation" => MetadataKind::Validation,
            "hook" => MetadataKind::Hook,
            "action" => MetadataKind::Action,
            "data" => MetadataKind::Data,
            other => MetadataKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MetadataKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MetadataKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(MetadataKind::from(name.as_str()))
    }
}

/// The registry's storage unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    #[serde(rename = "type")]
    pub kind: MetadataKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default)]
    pub content: Json,
}

impl MetadataEntry {
    pub fn new(kind: MetadataKind, id: impl Into<String>, content: Json) -> Self {
        Self {
            kind,
            id: id.into(),
            package: None,
            content,
        }
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    fn key(&self) -> EntryKey {
        (self.kind.clone(), self.id.clone())
    }
}

type EntryKey = (MetadataKind, String);

/// Standalone validation rules of one entry.
struct RuleSet {
    object: String,
    rules: Vec<ValidationRule>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<EntryKey, Arc<MetadataEntry>>,
    /// package name -> keys contributed by that package
    packages: HashMap<String, HashSet<EntryKey>>,
    objects: HashMap<String, Arc<ObjectDefinition>>,
    /// validation entry id -> parsed rules
    rule_sets: BTreeMap<String, RuleSet>,
}

impl RegistryState {
    fn remove(&mut self, key: &EntryKey) -> Option<Arc<MetadataEntry>> {
        let entry = self.entries.remove(key)?;
        if let Some(package) = &entry.package {
            if let Some(keys) = self.packages.get_mut(package) {
                keys.remove(key);
                if keys.is_empty() {
                    self.packages.remove(package);
                }
            }
        }
        match entry.kind {
            MetadataKind::Object => {
                self.objects.remove(&entry.id);
            }
            MetadataKind::Validation => {
                self.rule_sets.remove(&entry.id);
            }
            _ => {}
        }
        Some(entry)
    }
}

/// In-memory metadata catalog shared by every engine component.
pub struct MetadataRegistry {
    state: RwLock<RegistryState>,
    /// Bumped whenever an object definition changes.
    version: AtomicU64,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            version: AtomicU64::new(0),
        }
    }

    /// Register an entry, replacing any entry with the same `(type, id)`.
    ///
    /// Object and validation content is parsed here; an entry that does not
    /// parse is rejected and the registry is left unchanged.
    pub fn register(&self, entry: MetadataEntry) -> Result<(), SchemaError> {
        let parsed = Parsed::from_entry(&entry)?;
        let key = entry.key();
        let entry = Arc::new(entry);

        let mut state = self.state.write();
        let replaced = state.remove(&key).is_some();

        if let Some(package) = &entry.package {
            state
                .packages
                .entry(package.clone())
                .or_default()
                .insert(key.clone());
        }
        match parsed {
            Parsed::Object(object) => {
                state.objects.insert(entry.id.clone(), Arc::new(object));
            }
            Parsed::Rules(rules) => {
                state.rule_sets.insert(entry.id.clone(), rules);
            }
            Parsed::Opaque => {}
        }
        let bumps_version = entry.kind == MetadataKind::Object;
        state.entries.insert(key, Arc::clone(&entry));
        drop(state);

        if bumps_version {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        debug!(
            kind = %entry.kind,
            id = %entry.id,
            package = entry.package.as_deref().unwrap_or(""),
            replaced,
            "registered metadata"
        );
        Ok(())
    }

    /// Register an already-typed object definition.
    pub fn register_object(&self, object: ObjectDefinition, package: Option<&str>) -> Result<(), SchemaError> {
        let content = serde_json::to_value(&object).map_err(|e| SchemaError::InvalidDefinition {
            id: object.name.clone(),
            message: e.to_string(),
        })?;
        let mut entry = MetadataEntry::new(MetadataKind::Object, object.name.clone(), content);
        entry.package = package.map(str::to_string);
        self.register(entry)
    }

    pub fn get(&self, kind: &MetadataKind, id: &str) -> Option<Arc<MetadataEntry>> {
        self.state.read().entries.get(&(kind.clone(), id.to_string())).cloned()
    }

    /// Every entry of a type, ordered by id.
    pub fn list(&self, kind: &MetadataKind) -> Vec<Arc<MetadataEntry>> {
        let state = self.state.read();
        let mut entries: Vec<_> = state
            .entries
            .values()
            .filter(|e| &e.kind == kind)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn unregister(&self, kind: &MetadataKind, id: &str) -> Option<Arc<MetadataEntry>> {
        let removed = self.state.write().remove(&(kind.clone(), id.to_string()));
        if let Some(entry) = &removed {
            if entry.kind == MetadataKind::Object {
                self.version.fetch_add(1, Ordering::SeqCst);
            }
            debug!(kind = %kind, id, "unregistered metadata");
        }
        removed
    }

    /// Remove every entry contributed by a package. Returns how many were removed.
    pub fn unregister_package(&self, package: &str) -> usize {
        let mut state = self.state.write();
        let Some(keys) = state.packages.remove(package) else {
            return 0;
        };

        let mut objects_changed = false;
        let mut removed = 0;
        for key in &keys {
            if let Some(entry) = state.remove(key) {
                objects_changed |= entry.kind == MetadataKind::Object;
                removed += 1;
            }
        }
        drop(state);

        if objects_changed {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        info!(package, removed, "unregistered package");
        removed
    }

    /// Register a batch of raw `{type, id, package?, content}` values.
    ///
    /// Malformed entries are skipped with a warning. Returns the number
    /// registered.
    pub fn load_entries<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = Json>,
    {
        let mut loaded = 0;
        for raw in entries {
            let entry: MetadataEntry = match serde_json::from_value(raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping malformed metadata entry");
                    continue;
                }
            };
            let (kind, id) = (entry.kind.clone(), entry.id.clone());
            match self.register(entry) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(kind = %kind, id = %id, error = %e, "skipping invalid metadata entry"),
            }
        }
        loaded
    }

    pub fn get_object(&self, name: &str) -> Option<Arc<ObjectDefinition>> {
        self.state.read().objects.get(name).cloned()
    }

    pub fn require_object(&self, name: &str) -> Result<Arc<ObjectDefinition>, SchemaError> {
        self.get_object(name)
            .ok_or_else(|| SchemaError::UnknownObject(name.to_string()))
    }

    /// All registered objects, ordered by name.
    pub fn objects(&self) -> Vec<Arc<ObjectDefinition>> {
        let state = self.state.read();
        let mut objects: Vec<_> = state.objects.values().cloned().collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        objects
    }

    /// An object's own rules followed by standalone rules targeting it.
    pub fn rules_for(&self, object: &str) -> Vec<ValidationRule> {
        let state = self.state.read();
        let mut rules = state
            .objects
            .get(object)
            .map(|o| o.rules.clone())
            .unwrap_or_default();
        for set in state.rule_sets.values().filter(|s| s.object == object) {
            rules.extend(set.rules.iter().cloned());
        }
        rules
    }

    /// Packages with at least one entry.
    pub fn packages(&self) -> Vec<String> {
        let mut packages: Vec<_> = self.state.read().packages.keys().cloned().collect();
        packages.sort();
        packages
    }

    /// Schema version; changes whenever an object is registered or removed.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MetadataRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetadataRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("MetadataRegistry")
            .field("entries", &state.entries.len())
            .field("objects", &state.objects.len())
            .field("packages", &state.packages.len())
            .field("version", &self.version())
            .finish()
    }
}

enum Parsed {
    Object(ObjectDefinition),
    Rules(RuleSet),
    Opaque,
}

impl Parsed {
    fn from_entry(entry: &MetadataEntry) -> Result<Self, SchemaError> {
        let invalid = |message: String| SchemaError::InvalidDefinition {
            id: entry.id.clone(),
            message,
        };

        match entry.kind {
            MetadataKind::Object => {
                let mut object: ObjectDefinition =
                    serde_json::from_value(entry.content.clone()).map_err(|e| invalid(e.to_string()))?;
                object.normalize(&entry.id);
                Ok(Parsed::Object(object))
            }
            MetadataKind::Validation => {
                let content = entry
                    .content
                    .as_object()
                    .ok_or_else(|| invalid("validation content must be an object".into()))?;
                let object = content
                    .get("object")
                    .and_then(Json::as_str)
                    .ok_or_else(|| invalid("validation entry must name an 'object'".into()))?
                    .to_string();

                let rules = match content.get("rules") {
                    Some(Json::Array(items)) => items
                        .iter()
                        .map(|item| parse_rule(item, &entry.id))
                        .collect::<Result<Vec<_>, _>>(),
                    Some(_) => Err("'rules' must be an array".to_string()),
                    None => parse_rule(&entry.content, &entry.id).map(|rule| vec![rule]),
                }
                .map_err(invalid)?;

                Ok(Parsed::Rules(RuleSet { object, rules }))
            }
            _ => Ok(Parsed::Opaque),
        }
    }
}

/// Parse one rule, naming it after the entry when it has no name.
fn parse_rule(value: &Json, default_name: &str) -> Result<ValidationRule, String> {
    let mut value = value.clone();
    if let Some(map) = value.as_object_mut() {
        map.remove("object");
        map.entry("name")
            .or_insert_with(|| Json::String(default_name.to_string()));
    }
    serde_json::from_value(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object_entry(id: &str, package: Option<&str>) -> MetadataEntry {
        let entry = MetadataEntry::new(
            MetadataKind::Object,
            id,
            json!({"fields": {"name": {"type": "text"}}}),
        );
        match package {
            Some(p) => entry.with_package(p),
            None => entry,
        }
    }

    #[test]
    fn test_register_get_list() {
        let registry = MetadataRegistry::new();
        registry.register(object_entry("task", None)).unwrap();
        registry.register(object_entry("account", None)).unwrap();

        let entry = registry.get(&MetadataKind::Object, "task").unwrap();
        assert_eq!(entry.id, "task");

        let ids: Vec<_> = registry
            .list(&MetadataKind::Object)
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(ids, vec!["account", "task"]);

        let object = registry.get_object("task").unwrap();
        assert_eq!(object.name, "task");
        assert_eq!(object.fields["name"].name, "name");
        assert!(registry.get(&MetadataKind::Hook, "task").is_none());
    }

    #[test]
    fn test_register_overwrites_and_moves_package() {
        let registry = MetadataRegistry::new();
        registry.register(object_entry("task", Some("crm"))).unwrap();
        registry.register(object_entry("task", Some("pm"))).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.packages(), vec!["pm"]);
        assert_eq!(registry.unregister_package("crm"), 0);
        assert!(registry.get_object("task").is_some());
    }

    #[test]
    fn test_unregister_package_removes_only_its_entries() {
        let registry = MetadataRegistry::new();
        registry.register(object_entry("account", Some("crm"))).unwrap();
        registry.register(object_entry("contact", Some("crm"))).unwrap();
        registry.register(object_entry("project", Some("pm"))).unwrap();
        registry
            .register(MetadataEntry::new(MetadataKind::Hook, "audit", json!({})).with_package("crm"))
            .unwrap();
        registry.register(object_entry("user", None)).unwrap();

        let version = registry.version();
        assert_eq!(registry.unregister_package("crm"), 3);
        assert!(registry.version() > version);

        assert!(registry.get_object("account").is_none());
        assert!(registry.get(&MetadataKind::Hook, "audit").is_none());
        assert!(registry.get_object("project").is_some());
        assert!(registry.get_object("user").is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_load_entries_skips_malformed() {
        let registry = MetadataRegistry::new();
        let loaded = registry.load_entries(vec![
            json!({"type": "object", "id": "task", "content": {"fields": {}}}),
            json!({"id": "no_type"}),
            json!({"type": "object", "id": "broken", "content": {"fields": 12}}),
            json!({"type": "menu", "id": "main", "package": "ui"}),
        ]);
        assert_eq!(loaded, 2);
        assert!(registry.get_object("task").is_some());
        assert!(registry.get_object("broken").is_none());
        assert!(registry
            .get(&MetadataKind::Other("menu".into()), "main")
            .is_some());
    }

    #[test]
    fn test_standalone_validation_rules() {
        let registry = MetadataRegistry::new();
        registry
            .register(MetadataEntry::new(
                MetadataKind::Object,
                "project",
                json!({
                    "fields": {"name": {"type": "text"}},
                    "validations": [{"name": "name_required", "type": "field", "field": "name", "required": true}]
                }),
            ))
            .unwrap();
        registry
            .register(MetadataEntry::new(
                MetadataKind::Validation,
                "date_range",
                json!({
                    "object": "project",
                    "type": "cross_field",
                    "field": "end_date",
                    "operator": ">=",
                    "compare_to": "start_date",
                    "error_code": "INVALID_DATE_RANGE"
                }),
            ))
            .unwrap();

        let names: Vec<_> = registry.rules_for("project").into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["name_required", "date_range"]);

        registry.unregister(&MetadataKind::Validation, "date_range");
        assert_eq!(registry.rules_for("project").len(), 1);

        let err = registry
            .register(MetadataEntry::new(MetadataKind::Validation, "bad", json!({"type": "unique"})))
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidDefinition { .. }));
    }

    #[test]
    fn test_require_object() {
        let registry = MetadataRegistry::new();
        assert_eq!(
            registry.require_object("ghost").unwrap_err(),
            SchemaError::UnknownObject("ghost".into())
        );
    }
}
