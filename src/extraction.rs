//! Path-based field extraction from JSON documents.
//!
//! Schema `source` paths, placeholder names and identity fields all address
//! values inside vendor documents with the same dotted syntax:
//!
//! - `user.address.city` - nested object fields
//! - `items[0].name` or `items.0.name` - array elements
//! - `$.user.name` - JSONPath-style root prefix (`$` alone is the whole document)

use serde_json::Value as JsonValue;
use std::fmt;

/// Represents a path to a field in a JSON document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    /// The raw path string
    pub raw: String,
    /// Parsed path segments
    pub segments: Vec<PathSegment>,
}

/// A segment in a field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// A named field (e.g., "user", "name"). Numeric names also index arrays.
    Field(String),
    /// An explicit array index (e.g., [0], [5])
    Index(usize),
}

impl FieldPath {
    /// Parse a field path with a given delimiter
    ///
    /// # Example
    ///
    /// ```
    /// use databroker::FieldPath;
    ///
    /// let path = FieldPath::parse("user.address[1].city", ".");
    /// assert_eq!(path.segments.len(), 4);
    /// ```
    pub fn parse(path: &str, delimiter: &str) -> Self {
        let mut segments = Vec::new();

        for (position, part) in path.split(delimiter).enumerate() {
            if part.is_empty() {
                continue;
            }
            // JSONPath root marker
            if position == 0 && part == "$" {
                continue;
            }

            // Split `name[0][1]` into the field and its bracketed indices
            let (name, mut rest) = match part.find('[') {
                Some(idx) => (&part[..idx], &part[idx..]),
                None => (part, ""),
            };
            if !name.is_empty() {
                segments.push(PathSegment::Field(name.to_string()));
            }
            while let Some(stripped) = rest.strip_prefix('[') {
                let Some(end) = stripped.find(']') else {
                    // Unbalanced bracket: keep the remainder as a literal field name
                    segments.push(PathSegment::Field(rest.to_string()));
                    break;
                };
                let inner = stripped[..end].trim_matches(|c| c == '\'' || c == '"');
                match inner.parse::<usize>() {
                    Ok(index) => segments.push(PathSegment::Index(index)),
                    Err(_) => segments.push(PathSegment::Field(inner.to_string())),
                }
                rest = &stripped[end + 1..];
            }
        }

        Self {
            raw: path.to_string(),
            segments,
        }
    }

    /// Create a field path from a dotted string (common format)
    pub fn from_dotted(path: &str) -> Self {
        Self::parse(path, ".")
    }

    /// True when the path addresses the whole document (`""` or `$`)
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Resolve this path against a document.
    ///
    /// Returns `None` when any segment is missing. Unlike a plain field map,
    /// a numeric field name applied to an array indexes into it.
    pub fn lookup<'a>(&self, document: &'a JsonValue) -> Option<&'a JsonValue> {
        let mut current = document;
        for segment in &self.segments {
            current = match (segment, current) {
                (PathSegment::Field(name), JsonValue::Object(map)) => map.get(name)?,
                (PathSegment::Field(name), JsonValue::Array(items)) => {
                    items.get(name.parse::<usize>().ok()?)?
                }
                (PathSegment::Index(index), JsonValue::Array(items)) => items.get(*index)?,
                (PathSegment::Index(index), JsonValue::Object(map)) => {
                    map.get(&index.to_string())?
                }
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_path_parse() {
        let path = FieldPath::parse("user.address.city", ".");

        assert_eq!(path.segments.len(), 3);
        assert_eq!(path.segments[0], PathSegment::Field("user".to_string()));
        assert_eq!(
            path.segments[1],
            PathSegment::Field("address".to_string())
        );
        assert_eq!(path.segments[2], PathSegment::Field("city".to_string()));
    }

    #[test]
    fn test_field_path_with_index() {
        let path = FieldPath::parse("items[0].name", ".");

        assert_eq!(path.segments.len(), 3);
        assert_eq!(path.segments[0], PathSegment::Field("items".to_string()));
        assert_eq!(path.segments[1], PathSegment::Index(0));
        assert_eq!(path.segments[2], PathSegment::Field("name".to_string()));
    }

    #[test]
    fn test_field_path_root_forms() {
        assert!(FieldPath::from_dotted("").is_root());
        assert!(FieldPath::from_dotted("$").is_root());

        let path = FieldPath::from_dotted("$.a.b");
        assert_eq!(path.segments.len(), 2);
        assert_eq!(path.raw, "$.a.b");
    }

    #[test]
    fn test_lookup_nested() {
        let doc = json!({
            "zone": {"sensors": [{"id": "s1"}, {"id": "s2", "temp": 21.5}]}
        });

        let temp = FieldPath::from_dotted("zone.sensors[1].temp");
        assert_eq!(temp.lookup(&doc), Some(&json!(21.5)));

        let numeric = FieldPath::from_dotted("zone.sensors.0.id");
        assert_eq!(numeric.lookup(&doc), Some(&json!("s1")));

        let missing = FieldPath::from_dotted("zone.sensors[5].id");
        assert_eq!(missing.lookup(&doc), None);

        let root = FieldPath::from_dotted("");
        assert_eq!(root.lookup(&doc), Some(&doc));
    }
}
