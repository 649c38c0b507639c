//! Live entity cache.
//!
//! Holds the most recent raw event per entity, keyed by source identifier and
//! then by entity id. Writes are last-write-wins with no history. Entries live
//! until the process exits or a caller clears them.
//!
//! Queries support a multi-level wildcard: a requested id containing `#`
//! matches every entity id that starts with the text before the `#`.

use dashmap::DashMap;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// Multi-level wildcard marker in a queried id
pub const WILDCARD: char = '#';

/// One cached message returned by a query, with the id it was found under.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHit {
    pub id: String,
    pub message: JsonValue,
}

/// Per-source, per-entity store of the latest raw events.
#[derive(Debug, Clone, Default)]
pub struct EntityCache {
    sources: Arc<DashMap<String, IndexMap<String, JsonValue>>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `message` as the latest event for `entity_id`.
    ///
    /// # Returns
    /// The message previously cached for that entity, if any
    pub fn upsert(&self, source: &str, entity_id: &str, message: JsonValue) -> Option<JsonValue> {
        self.sources
            .entry(source.to_string())
            .or_default()
            .insert(entity_id.to_string(), message)
    }

    pub fn get(&self, source: &str, entity_id: &str) -> Option<JsonValue> {
        self.sources.get(source)?.get(entity_id).cloned()
    }

    /// All cached entities of a source, in first-seen order.
    pub fn snapshot(&self, source: &str) -> IndexMap<String, JsonValue> {
        self.sources
            .get(source)
            .map(|entities| entities.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, source: &str) -> usize {
        self.sources.get(source).map_or(0, |entities| entities.len())
    }

    /// Drop every cached entity of a source.
    pub fn clear(&self, source: &str) {
        self.sources.remove(source);
    }

    /// Look up cached messages for one requested id.
    ///
    /// # Arguments
    /// * `source` - Source identifier
    /// * `requested` - Entity id, or a `prefix#` wildcard
    /// * `id_field` - Identity field used to annotate and to scan messages
    ///
    /// # Returns
    /// Wildcard queries return every entity under a matching key, annotated
    /// with its id. Plain queries return the entity cached under that exact
    /// key, or else the first cached message (arrays flattened) whose
    /// `id_field` equals the requested id.
    pub fn query(&self, source: &str, requested: &str, id_field: &str) -> Vec<CacheHit> {
        let Some(entities) = self.sources.get(source) else {
            return Vec::new();
        };

        if let Some((prefix, _)) = requested.split_once(WILDCARD) {
            return entities
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, message)| CacheHit {
                    id: key.clone(),
                    message: annotate(key, message, id_field),
                })
                .collect();
        }

        if let Some(message) = entities.get(requested) {
            return vec![CacheHit {
                id: requested.to_string(),
                message: annotate(requested, message, id_field),
            }];
        }

        entities
            .values()
            .flat_map(|message| match message {
                JsonValue::Array(items) => items.iter().collect::<Vec<_>>(),
                other => vec![other],
            })
            .find(|message| identity_matches(message, id_field, requested))
            .map(|message| {
                vec![CacheHit {
                    id: requested.to_string(),
                    message: message.clone(),
                }]
            })
            .unwrap_or_default()
    }
}

fn identity_matches(message: &JsonValue, id_field: &str, requested: &str) -> bool {
    match message.get(id_field) {
        Some(JsonValue::String(id)) => id == requested,
        Some(JsonValue::Number(id)) => id.to_string() == requested,
        _ => false,
    }
}

/// Tag a cached message with the id it is stored under.
///
/// Objects get the id field prepended (an existing field wins), scalars are
/// wrapped as `{id_field: id, "message": value}`, arrays element-wise.
pub fn annotate(id: &str, message: &JsonValue, id_field: &str) -> JsonValue {
    match message {
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|item| annotate(id, item, id_field)).collect())
        }
        JsonValue::Object(fields) => {
            let mut annotated = Map::new();
            annotated.insert(id_field.to_string(), JsonValue::String(id.to_string()));
            for (key, value) in fields {
                annotated.insert(key.clone(), value.clone());
            }
            JsonValue::Object(annotated)
        }
        scalar => {
            let mut annotated = Map::new();
            annotated.insert(id_field.to_string(), JsonValue::String(id.to_string()));
            annotated.insert("message".to_string(), scalar.clone());
            JsonValue::Object(annotated)
        }
    }
}
