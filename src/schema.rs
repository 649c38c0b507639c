//! Declarative output schemas and the schema catalog.
//!
//! A schema is a JSON-Schema-like tree whose nodes additionally say where
//! each output value comes from:
//!
//! ```yaml
//! type: object
//! properties:
//!   "@type":
//!     type: string
//!     const: Elevator
//!   idLocal:
//!     type: string
//!     source: unitId
//!   updated:
//!     type: string
//!     source: ts
//!     function: Date.toISOString
//!   sensors:
//!     type: array
//!     source: readings
//!     items:
//!       type: object
//!       properties:
//!         value: { type: number, source: v }
//! ```
//!
//! Schemas are loaded once and shared read-only (`Arc<SchemaNode>`) by every
//! transformation.

use crate::error::SchemaError;
use crate::extraction::FieldPath;
use crate::handler_registry::HandlerSpec;
use crate::template::Template;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Output kinds a schema node can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Object,
    Array,
    String,
    Boolean,
    Integer,
    Number,
    Null,
}

/// `type` is either a single kind or a list of kinds tried in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeDecl {
    One(SchemaType),
    Many(Vec<SchemaType>),
}

impl TypeDecl {
    pub fn kinds(&self) -> &[SchemaType] {
        match self {
            TypeDecl::One(kind) => std::slice::from_ref(kind),
            TypeDecl::Many(kinds) => kinds,
        }
    }
}

/// A `source` path. The empty string means the whole current input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SourcePath(FieldPath);

impl SourcePath {
    pub fn path(&self) -> &FieldPath {
        &self.0
    }

    /// True for `""` (and `$`): the current input itself.
    pub fn is_whole(&self) -> bool {
        self.0.is_root()
    }

    pub fn lookup<'a>(&self, document: &'a JsonValue) -> Option<&'a JsonValue> {
        self.0.lookup(document)
    }
}

impl From<String> for SourcePath {
    fn from(raw: String) -> Self {
        SourcePath(FieldPath::from_dotted(&raw))
    }
}

impl From<&str> for SourcePath {
    fn from(raw: &str) -> Self {
        SourcePath(FieldPath::from_dotted(raw))
    }
}

impl From<SourcePath> for String {
    fn from(source: SourcePath) -> Self {
        source.0.raw
    }
}

/// One node of a declarative output schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaNode {
    #[serde(rename = "$id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TypeDecl>,

    /// Path into the input; `null` means no direct extraction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourcePath>,

    /// Placeholder template used instead of `source`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Template>,

    #[serde(rename = "const", default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<JsonValue>,

    /// Fallback for an empty or missing extracted value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<HandlerSpec>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, SchemaNode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaNode>>,

    /// Alternative item schemas, each applied to every array element
    #[serde(rename = "anyOf", default, skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<SchemaNode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SchemaNode {
    /// Declared kinds, empty when `type` is missing
    pub fn kinds(&self) -> &[SchemaType] {
        self.kind.as_ref().map(TypeDecl::kinds).unwrap_or(&[])
    }

    /// Parse a schema from a JSON value.
    pub fn from_json(name: &str, value: JsonValue) -> Result<Self, SchemaError> {
        serde_json::from_value(value).map_err(|e| SchemaError::Parse {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Parse a schema from JSON or YAML text.
    pub fn from_text(name: &str, contents: &str) -> Result<Self, SchemaError> {
        // YAML is a superset of JSON, but JSON errors read better from serde_json
        match serde_json::from_str(contents) {
            Ok(node) => Ok(node),
            Err(json_err) if contents.trim_start().starts_with('{') => Err(SchemaError::Parse {
                name: name.to_string(),
                reason: json_err.to_string(),
            }),
            Err(_) => serde_yaml::from_str(contents).map_err(|e| SchemaError::Parse {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Read-only catalog of named output schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    schemas: HashMap<String, Arc<SchemaNode>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema under a name, replacing any previous one.
    pub fn insert(&mut self, name: impl Into<String>, schema: SchemaNode) {
        self.schemas.insert(name.into(), Arc::new(schema));
    }

    pub fn get(&self, name: &str) -> Option<Arc<SchemaNode>> {
        self.schemas.get(name).cloned()
    }

    /// Look up a schema, failing with `SchemaError::NotFound`.
    pub fn require(&self, name: &str) -> Result<Arc<SchemaNode>, SchemaError> {
        self.get(name).ok_or_else(|| SchemaError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Load a schema file, registering it under its file stem.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<String, SchemaError> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|e| SchemaError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();

        let schema = SchemaNode::from_text(&name, &contents)?;
        self.insert(name.clone(), schema);

        tracing::info!("Loaded schema {} from {}", name, path.display());
        Ok(name)
    }

    /// Load every `*.json`, `*.yaml` and `*.yml` file in a directory.
    ///
    /// # Returns
    /// Number of schemas loaded
    pub fn load_from_dir<P: AsRef<Path>>(&mut self, dir_path: P) -> Result<usize, SchemaError> {
        let dir_path = dir_path.as_ref();

        if !dir_path.is_dir() {
            return Err(SchemaError::MissingDirectory(dir_path.display().to_string()));
        }

        let entries = fs::read_dir(dir_path).map_err(|e| SchemaError::Io {
            path: dir_path.display().to_string(),
            source: e,
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && matches!(
                        path.extension().and_then(|ext| ext.to_str()),
                        Some("json") | Some("yaml") | Some("yml")
                    )
            })
            .collect();
        paths.sort();

        let mut count = 0;
        for path in paths {
            self.load_file(&path)?;
            count += 1;
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_parse_node_fields() {
        let node = SchemaNode::from_json(
            "test",
            json!({
                "$id": "#/properties/updated",
                "type": "string",
                "source": "ts",
                "default": "n/a",
                "function": {"name": "Date.format", "args": ["%Y"]},
            }),
        )
        .unwrap();

        assert_eq!(node.kinds(), &[SchemaType::String]);
        assert_eq!(node.source, Some(SourcePath::from("ts")));
        assert_eq!(node.default, Some(json!("n/a")));
        assert_eq!(node.function, Some(HandlerSpec::with_args("Date.format", vec![json!("%Y")])));
    }

    #[test]
    fn test_null_and_empty_sources() {
        let node = SchemaNode::from_json(
            "test",
            json!({
                "type": "object",
                "source": null,
                "properties": {
                    "whole": {"type": "array", "source": ""},
                    "multi": {"type": ["string", "null"], "const": "x"}
                }
            }),
        )
        .unwrap();

        assert_eq!(node.source, None);
        assert!(node.properties["whole"].source.as_ref().unwrap().is_whole());
        assert_eq!(node.properties["multi"].kinds(), &[SchemaType::String, SchemaType::Null]);
    }

    #[test]
    fn test_properties_keep_declared_order() {
        let node = SchemaNode::from_text(
            "test",
            "type: object\nproperties:\n  zeta: {type: string}\n  alpha: {type: string}\n",
        )
        .unwrap();

        let keys: Vec<&String> = node.properties.keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_any_of_items() {
        let node = SchemaNode::from_json(
            "test",
            json!({
                "type": "array",
                "source": "rows",
                "items": {"anyOf": [{"type": "object"}, {"type": "object"}]}
            }),
        )
        .unwrap();

        assert_eq!(node.items.unwrap().any_of.len(), 2);
    }

    #[test]
    fn test_invalid_schema_is_reported() {
        let err = SchemaNode::from_text("broken", "{\"type\": \"unknown\"}").unwrap_err();
        assert!(matches!(err, SchemaError::Parse { .. }));
    }

    #[test]
    fn test_catalog_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();

        let mut json_file = std::fs::File::create(dir.path().join("occupancy.json")).unwrap();
        writeln!(json_file, "{{\"type\": \"object\", \"properties\": {{}}}}").unwrap();

        let mut yaml_file = std::fs::File::create(dir.path().join("elevator.yaml")).unwrap();
        writeln!(yaml_file, "type: object\nproperties:\n  id: {{type: string, source: id}}").unwrap();

        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut catalog = SchemaCatalog::new();
        let count = catalog.load_from_dir(dir.path()).unwrap();

        assert_eq!(count, 2);
        assert_eq!(catalog.names(), vec!["elevator".to_string(), "occupancy".to_string()]);
        assert!(catalog.get("elevator").unwrap().properties.contains_key("id"));
        assert!(matches!(catalog.require("missing"), Err(SchemaError::NotFound(_))));
    }

    #[test]
    fn test_catalog_missing_dir() {
        let mut catalog = SchemaCatalog::new();
        let result = catalog.load_from_dir("/nonexistent/schemas");
        assert!(matches!(result, Err(SchemaError::MissingDirectory(_))));
    }
}
