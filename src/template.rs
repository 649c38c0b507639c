//! Placeholder substitution engine.
//!
//! Templates are JSON documents whose string leaves may carry `${path}`
//! placeholders. A template is compiled once into a typed tree where every
//! string leaf is either a plain literal or a [`TemplateText`] made of literal
//! and placeholder parts, so substitution walks the structure directly and
//! never round-trips through text.
//!
//! Substitution rules:
//!
//! - A string leaf that is exactly one placeholder (`"${name}"`) is replaced
//!   by the resolved value with its JSON type intact (number, object, ...).
//! - A placeholder embedded in longer text is interpolated as text. A
//!   structured value embedded this way is written as its JSON encoding.
//! - Placeholder names are resolved as exact keys of the value first, then as
//!   paths into it (`${zone.name}`, `${items[0].id}`, `${$}` for the root).
//! - Compatibility rule for older schemas: an unmatched `${id}` is satisfied
//!   by the value's `idLocal` field, and a template that is exactly `"${id}"`
//!   with neither field present receives the whole object.
//! - The whole-value placeholder (the `placeholder` argument of
//!   [`Template::render`]) is replaced by the complete value. When the value
//!   is absent and the template is exactly that placeholder, the result is
//!   absent.
//! - Substituted text may itself contain placeholders; rendering repeats
//!   until no resolvable placeholder is left (bounded by [`MAX_PASSES`]).

use crate::error::TemplateError;
use crate::extraction::FieldPath;
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Upper bound on nested substitution passes.
pub const MAX_PASSES: usize = 8;

/// Placeholder resolved against the whole current source document.
pub const ROOT_PLACEHOLDER: &str = "$";

const ID: &str = "id";
const ID_LOCAL: &str = "idLocal";

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^{}]+)\}").expect("placeholder pattern is valid"));

/// A compiled template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "JsonValue", into = "JsonValue")]
pub enum Template {
    /// A subtree without any placeholder
    Literal(JsonValue),
    /// A string leaf containing at least one placeholder
    Text(TemplateText),
    Array(Vec<Template>),
    Object(IndexMap<String, Template>),
}

/// A string leaf split into literal and placeholder parts.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateText {
    raw: String,
    parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextPart {
    Literal(String),
    Placeholder(String),
}

impl TemplateText {
    /// Split a string into parts. Returns `None` when it has no placeholder.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = Vec::new();
        let mut last = 0;

        for captures in PLACEHOLDER.captures_iter(raw) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            if whole.start() > last {
                parts.push(TextPart::Literal(raw[last..whole.start()].to_string()));
            }
            parts.push(TextPart::Placeholder(name.as_str().trim().to_string()));
            last = whole.end();
        }

        if !parts.iter().any(|p| matches!(p, TextPart::Placeholder(_))) {
            return None;
        }
        if last < raw.len() {
            parts.push(TextPart::Literal(raw[last..].to_string()));
        }

        Some(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    /// The placeholder name when the whole string is a single placeholder.
    pub fn whole_placeholder(&self) -> Option<&str> {
        match self.parts.as_slice() {
            [TextPart::Placeholder(name)] => Some(name),
            _ => None,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn parts(&self) -> &[TextPart] {
        &self.parts
    }
}

impl Template {
    /// Compile a JSON template.
    pub fn compile(value: &JsonValue) -> Self {
        match value {
            JsonValue::String(s) => match TemplateText::parse(s) {
                Some(text) => Template::Text(text),
                None => Template::Literal(value.clone()),
            },
            JsonValue::Array(items) => {
                let compiled: Vec<Template> = items.iter().map(Template::compile).collect();
                if compiled.iter().all(Template::is_literal) {
                    Template::Literal(value.clone())
                } else {
                    Template::Array(compiled)
                }
            }
            JsonValue::Object(map) => {
                let compiled: IndexMap<String, Template> = map
                    .iter()
                    .map(|(key, child)| (key.clone(), Template::compile(child)))
                    .collect();
                if compiled.values().all(Template::is_literal) {
                    Template::Literal(value.clone())
                } else {
                    Template::Object(compiled)
                }
            }
            _ => Template::Literal(value.clone()),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Template::Literal(_))
    }

    /// True when the template is exactly the placeholder `${name}`.
    pub fn is_placeholder(&self, name: &str) -> bool {
        matches!(self, Template::Text(text) if text.whole_placeholder() == Some(name))
    }

    /// All placeholder names referenced by the template, in document order.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_placeholders(&mut names);
        names
    }

    fn collect_placeholders<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Template::Literal(_) => {}
            Template::Text(text) => {
                for part in &text.parts {
                    if let TextPart::Placeholder(name) = part {
                        names.push(name);
                    }
                }
            }
            Template::Array(items) => items.iter().for_each(|t| t.collect_placeholders(names)),
            Template::Object(map) => map.values().for_each(|t| t.collect_placeholders(names)),
        }
    }

    /// The template as JSON, placeholders left unresolved.
    pub fn to_value(&self) -> JsonValue {
        match self {
            Template::Literal(value) => value.clone(),
            Template::Text(text) => JsonValue::String(text.raw.clone()),
            Template::Array(items) => JsonValue::Array(items.iter().map(Template::to_value).collect()),
            Template::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(key, child)| (key.clone(), child.to_value()))
                    .collect(),
            ),
        }
    }

    /// Substitute placeholders with values drawn from `value`.
    ///
    /// # Arguments
    /// * `placeholder` - Name of the placeholder standing for the whole value
    /// * `value` - Source value; `None` means absent
    ///
    /// # Returns
    /// The rendered document, or `None` when the value is absent and the
    /// template is exactly the whole-value placeholder.
    pub fn render(&self, placeholder: Option<&str>, value: Option<&JsonValue>) -> Option<JsonValue> {
        let Some(value) = value else {
            if placeholder.is_some_and(|name| self.is_placeholder(name)) {
                return None;
            }
            return Some(self.to_value());
        };

        let resolver = Resolver {
            placeholder,
            value,
            whole_id: self.is_placeholder(ID),
        };

        let mut current = resolver.render(self);
        for _ in 0..MAX_PASSES {
            let nested = Template::compile(&current);
            if !nested.placeholders().iter().any(|name| resolver.resolve(name).is_some()) {
                return Some(current);
            }
            let next = resolver.render(&nested);
            if next == current {
                return Some(current);
            }
            current = next;
        }

        tracing::debug!("{}", TemplateError::NestingTooDeep(MAX_PASSES));
        Some(current)
    }

    /// Substitute a timestamp, normalised to an ISO-8601 UTC string.
    pub fn render_date(&self, placeholder: Option<&str>, date: &DateTime<Utc>) -> Option<JsonValue> {
        let value = JsonValue::String(iso_timestamp(date));
        self.render(placeholder, Some(&value))
    }
}

impl From<JsonValue> for Template {
    fn from(value: JsonValue) -> Self {
        Template::compile(&value)
    }
}

impl From<Template> for JsonValue {
    fn from(template: Template) -> Self {
        template.to_value()
    }
}

/// Compile and render a JSON template in one step.
pub fn substitute(template: &JsonValue, placeholder: Option<&str>, value: Option<&JsonValue>) -> Option<JsonValue> {
    Template::compile(template).render(placeholder, value)
}

/// Format a timestamp the way substituted dates appear in output documents.
pub fn iso_timestamp(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

struct Resolver<'a> {
    placeholder: Option<&'a str>,
    value: &'a JsonValue,
    whole_id: bool,
}

impl<'a> Resolver<'a> {
    fn resolve(&self, name: &str) -> Option<&'a JsonValue> {
        if let JsonValue::Object(map) = self.value {
            if let Some(found) = map.get(name) {
                return Some(found);
            }
        }
        if let Some(found) = FieldPath::from_dotted(name).lookup(self.value) {
            return Some(found);
        }
        if name == ID {
            if let Some(local) = self.value.get(ID_LOCAL) {
                return Some(local);
            }
        }
        if self.placeholder == Some(name) {
            return Some(self.value);
        }
        if name == ID && self.whole_id {
            if let JsonValue::Object(map) = self.value {
                if !map.is_empty() {
                    return Some(self.value);
                }
            }
        }
        None
    }

    fn render(&self, template: &Template) -> JsonValue {
        match template {
            Template::Literal(value) => value.clone(),
            Template::Text(text) => self.render_text(text),
            Template::Array(items) => JsonValue::Array(items.iter().map(|t| self.render(t)).collect()),
            Template::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(key, child)| (key.clone(), self.render(child)))
                    .collect(),
            ),
        }
    }

    fn render_text(&self, text: &TemplateText) -> JsonValue {
        if let Some(name) = text.whole_placeholder() {
            return match self.resolve(name) {
                Some(found) => found.clone(),
                None => {
                    tracing::debug!("{}", TemplateError::Unresolved(name.to_string()));
                    JsonValue::String(text.raw.clone())
                }
            };
        }

        let mut out = String::with_capacity(text.raw.len());
        for part in &text.parts {
            match part {
                TextPart::Literal(literal) => out.push_str(literal),
                TextPart::Placeholder(name) => match self.resolve(name) {
                    Some(JsonValue::String(s)) => out.push_str(s),
                    Some(found @ (JsonValue::Object(_) | JsonValue::Array(_))) => {
                        tracing::debug!(placeholder = %name, "Embedding structured value as literal text");
                        out.push_str(&found.to_string());
                    }
                    Some(found) => out.push_str(&found.to_string()),
                    None => {
                        tracing::debug!("{}", TemplateError::Unresolved(name.clone()));
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                },
            }
        }
        JsonValue::String(out)
    }
}
