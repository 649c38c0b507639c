//! Schema Transformer.
//!
//! Interprets a [`SchemaNode`] tree against a vendor document and builds the
//! output document. Every failure is recovered at the node where it happens:
//! a bad field yields absent (`None`) and the rest of the document survives.
//!
//! Declared types are not enforced on produced values. A `string` node whose
//! source holds a number emits the number.
//!
//! A `value` template whose placeholders cannot be resolved still produces
//! output: the unresolved `${...}` text is emitted verbatim. This keeps output
//! compatible with existing consumers of the broker's documents, which expect
//! the placeholder text rather than a missing field.

use crate::error::TransformError;
use crate::handler_registry::HandlerRegistry;
use crate::schema::{SchemaNode, SchemaType};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// Nesting limit for schema evaluation.
pub const MAX_DEPTH: usize = 64;

/// Applies declarative schemas to source documents.
#[derive(Clone, Default)]
pub struct Transformer {
    handlers: Arc<HandlerRegistry>,
}

impl Transformer {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self { handlers }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Transform `source` according to `node`.
    ///
    /// # Arguments
    /// * `source` - Vendor document, read-only
    /// * `node` - Schema describing the output shape
    ///
    /// # Returns
    /// The output document, or `None` when nothing could be produced
    pub fn transform(&self, source: &JsonValue, node: &SchemaNode) -> Option<JsonValue> {
        match self.evaluate(source, node, 0) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("Transform failed at root: {}", e);
                None
            }
        }
    }

    fn evaluate(
        &self,
        source: &JsonValue,
        node: &SchemaNode,
        depth: usize,
    ) -> Result<Option<JsonValue>, TransformError> {
        if depth > MAX_DEPTH {
            return Err(TransformError::DepthExceeded(MAX_DEPTH));
        }

        // Several kinds are tried in order; the last one producing a value wins
        let mut result = None;
        for kind in node.kinds() {
            let produced = match kind {
                SchemaType::Object => self.evaluate_object(source, node, depth)?,
                SchemaType::Array => self.evaluate_array(source, node, depth)?,
                SchemaType::String
                | SchemaType::Boolean
                | SchemaType::Integer
                | SchemaType::Number
                | SchemaType::Null => self.evaluate_scalar(source, node),
            };
            if produced.is_some() {
                result = produced;
            }
        }
        Ok(result)
    }

    /// Evaluate a child node, turning its error into absent.
    fn evaluate_child(&self, source: &JsonValue, node: &SchemaNode, depth: usize) -> Option<JsonValue> {
        match self.evaluate(source, node, depth + 1) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(node = ?node.id, "Skipping schema node: {}", e);
                None
            }
        }
    }

    fn evaluate_object(
        &self,
        source: &JsonValue,
        node: &SchemaNode,
        depth: usize,
    ) -> Result<Option<JsonValue>, TransformError> {
        // A non-root source narrows the input seen by the properties
        let input = match &node.source {
            Some(path) if !path.is_whole() => match path.lookup(source) {
                Some(found) => found,
                None => return Ok(None),
            },
            _ => source,
        };

        let mut object = Map::new();
        for (name, child) in &node.properties {
            if let Some(value) = self.evaluate_child(input, child, depth) {
                object.insert(name.clone(), value);
            }
        }

        if object.is_empty() {
            return Ok(None);
        }
        Ok(Some(JsonValue::Object(object)))
    }

    fn evaluate_array(
        &self,
        source: &JsonValue,
        node: &SchemaNode,
        depth: usize,
    ) -> Result<Option<JsonValue>, TransformError> {
        if let Some(template) = &node.value {
            let rendered = template.render(None, Some(source));
            return Ok(rendered.map(|value| JsonValue::Array(vec![value])));
        }

        let Some(path) = &node.source else {
            return Ok(None);
        };
        let elements = match path.lookup(source) {
            None => return Ok(None),
            Some(JsonValue::Array(items)) => items.iter().collect::<Vec<_>>(),
            Some(scalar) => vec![scalar],
        };

        let mut output = Vec::new();
        let Some(items) = node.items.as_deref() else {
            return Ok(Some(JsonValue::Array(output)));
        };

        for element in elements {
            if !items.any_of.is_empty() {
                for alternative in &items.any_of {
                    let value = self.evaluate_child(element, alternative, depth);
                    output.push(value.unwrap_or(JsonValue::Null));
                }
            } else if !items.properties.is_empty() {
                if let Some(value) = self.evaluate_child(element, items, depth) {
                    output.push(value);
                }
            }
        }

        Ok(Some(JsonValue::Array(output)))
    }

    fn evaluate_scalar(&self, source: &JsonValue, node: &SchemaNode) -> Option<JsonValue> {
        if let Some(template) = &node.value {
            let rendered = template.render(None, Some(source))?;
            return Some(self.apply_function(rendered, node));
        }

        if let Some(path) = node.source.as_ref().filter(|path| !path.is_whole()) {
            let extracted = match path.lookup(source) {
                Some(empty @ JsonValue::String(s)) if s.is_empty() => {
                    Some(node.default.clone().unwrap_or_else(|| empty.clone()))
                }
                Some(found) => Some(found.clone()),
                None => node.default.clone(),
            };
            return extracted.map(|value| self.apply_function(value, node));
        }

        node.constant.clone()
    }

    fn apply_function(&self, value: JsonValue, node: &SchemaNode) -> JsonValue {
        match &node.function {
            Some(spec) => self.handlers.apply(&value, spec),
            None => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(value: JsonValue) -> SchemaNode {
        SchemaNode::from_json("test", value).unwrap()
    }

    fn transformer() -> Transformer {
        Transformer::new(Arc::new(HandlerRegistry::with_builtins()))
    }

    #[test]
    fn test_object_with_sources_and_const() {
        let node = schema(json!({
            "type": "object",
            "properties": {
                "@type": {"type": "string", "const": "Elevator"},
                "idLocal": {"type": "string", "source": "unit.id"},
                "floor": {"type": "integer", "source": "unit.floor"}
            }
        }));
        let source = json!({"unit": {"id": "E1", "floor": 4}});

        let output = transformer().transform(&source, &node).unwrap();
        assert_eq!(output, json!({"@type": "Elevator", "idLocal": "E1", "floor": 4}));
    }

    #[test]
    fn test_empty_object_is_pruned() {
        let node = schema(json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "source": "missing"},
                "nested": {
                    "type": "object",
                    "properties": {"deep": {"type": "string", "source": "also.missing"}}
                }
            }
        }));

        assert_eq!(transformer().transform(&json!({"other": 1}), &node), None);
    }

    #[test]
    fn test_partially_empty_object_keeps_present_keys() {
        let node = schema(json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "source": "name"},
                "nested": {
                    "type": "object",
                    "properties": {"deep": {"type": "string", "source": "missing"}}
                }
            }
        }));

        let output = transformer().transform(&json!({"name": "Lobby"}), &node).unwrap();
        assert_eq!(output, json!({"name": "Lobby"}));
    }

    #[test]
    fn test_any_of_output_length() {
        let node = schema(json!({
            "type": "array",
            "source": "rows",
            "items": {
                "anyOf": [
                    {"type": "object", "properties": {"a": {"type": "string", "source": "a"}}},
                    {"type": "object", "properties": {"b": {"type": "string", "source": "b"}}},
                    {"type": "object", "properties": {"c": {"type": "string", "source": "c"}}}
                ]
            }
        }));
        let source = json!({"rows": [{"a": "1", "b": "2"}, {"c": "3"}]});

        let output = transformer().transform(&source, &node).unwrap();
        let rows = output.as_array().unwrap();
        assert_eq!(rows.len(), 2 * 3);
        assert_eq!(rows[0], json!({"a": "1"}));
        assert_eq!(rows[2], JsonValue::Null);
        assert_eq!(rows[5], json!({"c": "3"}));
    }

    #[test]
    fn test_array_scalar_source_is_wrapped() {
        let node = schema(json!({
            "type": "array",
            "source": "reading",
            "items": {"type": "object", "properties": {"v": {"type": "number", "source": "v"}}}
        }));

        let output = transformer().transform(&json!({"reading": {"v": 1.5}}), &node).unwrap();
        assert_eq!(output, json!([{"v": 1.5}]));
    }

    #[test]
    fn test_array_whole_source_and_missing_source() {
        let node = schema(json!({
            "type": "array",
            "source": "",
            "items": {"type": "object", "properties": {"id": {"type": "string", "source": "id"}}}
        }));
        let output = transformer().transform(&json!([{"id": "a"}, {"id": "b"}, {}]), &node).unwrap();
        assert_eq!(output, json!([{"id": "a"}, {"id": "b"}]));

        let missing = schema(json!({"type": "array", "source": "nope", "items": {"anyOf": []}}));
        assert_eq!(transformer().transform(&json!({}), &missing), None);
    }

    #[test]
    fn test_items_without_properties_or_any_of_are_skipped() {
        let node = schema(json!({
            "type": "array",
            "source": "tags",
            "items": {"type": "string", "source": ""}
        }));

        let output = transformer().transform(&json!({"tags": ["a", "b"]}), &node).unwrap();
        assert_eq!(output, json!([]));
    }

    #[test]
    fn test_array_value_template() {
        let node = schema(json!({
            "type": "array",
            "value": {"@type": "Sensor", "id": "${sensor}"}
        }));

        let output = transformer().transform(&json!({"sensor": "s-9"}), &node).unwrap();
        assert_eq!(output, json!([{"@type": "Sensor", "id": "s-9"}]));
    }

    #[test]
    fn test_scalar_default_on_empty_string() {
        let node = schema(json!({
            "type": "object",
            "properties": {
                "status": {"type": "string", "source": "status", "default": "unknown"},
                "absent": {"type": "string", "source": "missing", "default": "n/a"},
                "plain": {"type": "string", "source": "plain"}
            }
        }));

        let output = transformer()
            .transform(&json!({"status": "", "plain": ""}), &node)
            .unwrap();
        assert_eq!(output, json!({"status": "unknown", "absent": "n/a", "plain": ""}));
    }

    #[test]
    fn test_scalar_value_with_function() {
        let node = schema(json!({
            "type": "string",
            "value": "${name}",
            "function": "String.toUpperCase"
        }));

        let output = transformer().transform(&json!({"name": "lobby"}), &node);
        assert_eq!(output, Some(json!("LOBBY")));
    }

    #[test]
    fn test_unresolved_value_placeholder_is_emitted_verbatim() {
        let whole = schema(json!({"type": "string", "value": "${missing}"}));
        assert_eq!(transformer().transform(&json!({"name": "lobby"}), &whole), Some(json!("${missing}")));

        let mixed = schema(json!({"type": "string", "value": "${name} on ${floor}"}));
        assert_eq!(
            transformer().transform(&json!({"name": "lobby"}), &mixed),
            Some(json!("lobby on ${floor}"))
        );
    }

    #[test]
    fn test_source_with_date_function() {
        let node = schema(json!({
            "type": "string",
            "source": "ts",
            "function": "Date.toISOString"
        }));

        let output = transformer().transform(&json!({"ts": "1700000000000"}), &node);
        assert_eq!(output, Some(json!("2023-11-14T22:13:20.000Z")));
    }

    #[test]
    fn test_unknown_function_keeps_value() {
        let node = schema(json!({"type": "number", "source": "n", "function": "Math.nope"}));
        assert_eq!(transformer().transform(&json!({"n": 3}), &node), Some(json!(3)));
    }

    #[test]
    fn test_declared_type_not_enforced() {
        let node = schema(json!({"type": "string", "source": "n"}));
        assert_eq!(transformer().transform(&json!({"n": 42}), &node), Some(json!(42)));
    }

    #[test]
    fn test_multi_type_keeps_last_result() {
        let node = schema(json!({
            "type": ["string", "array"],
            "source": "v",
            "items": {"type": "object", "properties": {"x": {"type": "number", "source": ""}}}
        }));

        let output = transformer().transform(&json!({"v": "text"}), &node);
        // The array pass wraps the scalar but finds no `x`, so it yields an empty array
        assert_eq!(output, Some(json!([])));
    }

    #[test]
    fn test_missing_type_yields_absent() {
        let node = schema(json!({"source": "a"}));
        assert_eq!(transformer().transform(&json!({"a": 1}), &node), None);
    }

    #[test]
    fn test_object_source_narrows_input() {
        let node = schema(json!({
            "type": "object",
            "source": "location",
            "properties": {"lat": {"type": "number", "source": "lat"}}
        }));

        let output = transformer().transform(&json!({"location": {"lat": 61.5}}), &node);
        assert_eq!(output, Some(json!({"lat": 61.5})));
    }

    #[test]
    fn test_depth_limit_is_recovered() {
        let mut node = schema(json!({"type": "string", "const": "leaf"}));
        for _ in 0..(MAX_DEPTH + 5) {
            let mut parent = schema(json!({"type": "object"}));
            parent.properties.insert("child".to_string(), node);
            node = parent;
        }

        assert_eq!(transformer().transform(&json!({}), &node), None);
    }

    #[test]
    fn test_transform_is_idempotent() {
        let node = schema(json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "value": "urn:${id}"},
                "rows": {
                    "type": "array",
                    "source": "rows",
                    "items": {"type": "object", "properties": {"v": {"type": "number", "source": "v"}}}
                }
            }
        }));
        let source = json!({"id": "x", "rows": [{"v": 1}, {"v": 2}]});
        let t = transformer();

        let first = t.transform(&source, &node);
        let second = t.transform(&source, &node);
        assert_eq!(first, second);
        assert_eq!(first, Some(json!({"id": "urn:x", "rows": [{"v": 1}, {"v": 2}]})));
    }
}
