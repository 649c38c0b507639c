//! Value handler registry for post-processing extracted values.
//!
//! Schema nodes may declare a `function` to convert a single value after it
//! has been extracted, e.g. `Date.toISOString` or `{"name": "String.substring",
//! "args": [0, 4]}`. Handler names are `Namespace.method` or a bare name:
//!
//! - `Date.*` coerces the input to a UTC timestamp first (an empty string
//!   means "now", a 13-digit numeric string is epoch milliseconds).
//! - `String.*` coerces the input to text.
//! - Any other namespace, or none, passes the JSON value through unchanged.
//!
//! Lookup tries the full name among the native operations first, then the bare
//! method name among the domain helpers. Unknown names and failing handlers
//! leave the value untouched: [`HandlerRegistry::apply`] never fails.

use crate::error::HandlerError;
use crate::template::iso_timestamp;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// A handler reference as written in a schema node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "HandlerSpecRepr")]
pub struct HandlerSpec {
    /// Handler name, optionally namespaced (`Date.getMonth`)
    pub name: String,
    /// Positional arguments
    pub args: Vec<JsonValue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HandlerSpecRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        args: Vec<JsonValue>,
    },
}

impl From<HandlerSpecRepr> for HandlerSpec {
    fn from(repr: HandlerSpecRepr) -> Self {
        match repr {
            HandlerSpecRepr::Name(name) => Self { name, args: Vec::new() },
            HandlerSpecRepr::Full { name, args } => Self { name, args },
        }
    }
}

impl HandlerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(name: impl Into<String>, args: Vec<JsonValue>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Split `Type.method` into namespace and method.
    pub fn split(&self) -> (Option<&str>, &str) {
        match self.name.split_once('.') {
            Some((namespace, method)) => (Some(namespace), method),
            None => (None, self.name.as_str()),
        }
    }
}

/// Input value after namespace coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerInput {
    Date(DateTime<Utc>),
    Text(String),
    Json(JsonValue),
}

impl HandlerInput {
    /// Coerce a value for the given namespace.
    pub fn coerce(namespace: Option<&str>, value: &JsonValue) -> Result<Self, HandlerError> {
        match namespace {
            Some("Date") => coerce_date(value).map(HandlerInput::Date),
            Some("String") => Ok(HandlerInput::Text(coerce_text(value))),
            _ => Ok(HandlerInput::Json(value.clone())),
        }
    }

    pub fn as_date(&self) -> Result<DateTime<Utc>, HandlerError> {
        match self {
            HandlerInput::Date(date) => Ok(*date),
            HandlerInput::Text(text) => coerce_date(&JsonValue::String(text.clone())),
            HandlerInput::Json(value) => coerce_date(value),
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            HandlerInput::Date(date) => iso_timestamp(date),
            HandlerInput::Text(text) => text.clone(),
            HandlerInput::Json(value) => coerce_text(value),
        }
    }
}

/// Trait for value handler functions
pub trait HandlerFn: Send + Sync {
    /// Execute the handler on a coerced input with positional arguments
    fn execute(&self, input: &HandlerInput, args: &[JsonValue]) -> Result<JsonValue, HandlerError>;
}

/// Simple function-based implementation of HandlerFn
impl<F> HandlerFn for F
where
    F: Fn(&HandlerInput, &[JsonValue]) -> Result<JsonValue, HandlerError> + Send + Sync,
{
    fn execute(&self, input: &HandlerInput, args: &[JsonValue]) -> Result<JsonValue, HandlerError> {
        self(input, args)
    }
}

/// Registry of native operations and domain helpers
pub struct HandlerRegistry {
    /// Operations keyed by full name (`Date.toISOString`)
    natives: HashMap<String, Box<dyn HandlerFn>>,
    /// Domain helpers keyed by bare name (`monthName`)
    helpers: HashMap<String, Box<dyn HandlerFn>>,
}

impl HandlerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            natives: HashMap::new(),
            helpers: HashMap::new(),
        }
    }

    /// Create a registry populated with the `Date` and `String` operations
    /// and the built-in domain helpers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_date_natives(&mut registry);
        register_string_natives(&mut registry);
        register_helpers(&mut registry);
        registry
    }

    /// Register a native operation under its full name
    pub fn register<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&HandlerInput, &[JsonValue]) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
    {
        self.natives.insert(name.into(), Box::new(func));
    }

    /// Register a domain helper under a bare name
    pub fn register_helper<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&HandlerInput, &[JsonValue]) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
    {
        self.helpers.insert(name.into(), Box::new(func));
    }

    /// Check if a handler name resolves to a native operation or helper
    pub fn has_handler(&self, name: &str) -> bool {
        if self.natives.contains_key(name) {
            return true;
        }
        let method = name.split_once('.').map(|(_, m)| m).unwrap_or(name);
        self.helpers.contains_key(method)
    }

    /// Get list of all registered handler names
    pub fn list_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.natives.keys().chain(self.helpers.keys()).cloned().collect();
        names.sort();
        names
    }

    /// Dispatch a handler, reporting failures.
    ///
    /// # Returns
    ///
    /// * `Ok(Value)` - Handler result
    /// * `Err(HandlerError)` - Coercion failed, the handler is unknown or it rejected its arguments
    pub fn call(&self, value: &JsonValue, spec: &HandlerSpec) -> Result<JsonValue, HandlerError> {
        let (namespace, method) = spec.split();

        let handler = self
            .natives
            .get(&spec.name)
            .or_else(|| self.helpers.get(method))
            .ok_or_else(|| HandlerError::NotFound(spec.name.clone()))?;

        let input = HandlerInput::coerce(namespace, value)?;
        handler.execute(&input, &spec.args)
    }

    /// Dispatch a handler, returning the original value on any failure.
    pub fn apply(&self, value: &JsonValue, spec: &HandlerSpec) -> JsonValue {
        match self.call(value, spec) {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(handler = %spec.name, "Handler skipped: {}", e);
                value.clone()
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Parse a timestamp from the textual forms vendors commonly send.
///
/// Accepts RFC 3339, RFC 2822, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS`
/// (both read as UTC), `YYYY-MM-DD`, 13-digit epoch milliseconds and 10-digit
/// epoch seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        let number: i64 = raw.parse().ok()?;
        return match raw.len() {
            10 => Utc.timestamp_opt(number, 0).single(),
            _ => Utc.timestamp_millis_opt(number).single(),
        };
    }

    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(date) = DateTime::parse_from_rfc2822(raw) {
        return Some(date.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn coerce_date(value: &JsonValue) -> Result<DateTime<Utc>, HandlerError> {
    let failed = || HandlerError::Coercion {
        value: value.to_string(),
        target: "Date",
    };

    match value {
        JsonValue::String(s) if s.is_empty() => Ok(Utc::now()),
        JsonValue::String(s) => parse_timestamp(s).ok_or_else(failed),
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .ok_or_else(failed),
        _ => Err(failed()),
    }
}

fn coerce_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn arg_i64(args: &[JsonValue], index: usize, handler: &str) -> Result<Option<i64>, HandlerError> {
    match args.get(index) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| HandlerError::InvalidArgs {
                handler: handler.to_string(),
                reason: format!("argument {} is not a number", index),
            }),
    }
}

fn arg_str<'a>(args: &'a [JsonValue], index: usize, handler: &str) -> Result<&'a str, HandlerError> {
    args.get(index)
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerError::InvalidArgs {
            handler: handler.to_string(),
            reason: format!("argument {} must be a string", index),
        })
}

/// Upper bound on the target length accepted by `String.padStart`.
const MAX_PAD_LENGTH: usize = 4096;

/// Clamp a possibly negative index the way `String.prototype.slice` does.
fn relative_index(index: i64, len: usize) -> usize {
    if index < 0 {
        len.saturating_sub(index.unsigned_abs() as usize)
    } else {
        (index as usize).min(len)
    }
}

fn register_date_natives(registry: &mut HandlerRegistry) {
    fn date_getter<F>(registry: &mut HandlerRegistry, name: &str, get: F)
    where
        F: Fn(&DateTime<Utc>) -> JsonValue + Send + Sync + 'static,
    {
        registry.register(format!("Date.{}", name), move |input: &HandlerInput, _args: &[JsonValue]| {
            Ok(get(&input.as_date()?))
        });
    }

    date_getter(registry, "toISOString", |d| JsonValue::from(iso_timestamp(d)));
    date_getter(registry, "toJSON", |d| JsonValue::from(iso_timestamp(d)));
    date_getter(registry, "toUTCString", |d| {
        JsonValue::from(d.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
    });
    date_getter(registry, "getTime", |d| JsonValue::from(d.timestamp_millis()));
    date_getter(registry, "valueOf", |d| JsonValue::from(d.timestamp_millis()));
    date_getter(registry, "getFullYear", |d| JsonValue::from(d.year()));
    // Zero-based, as in the JavaScript Date API vendors' schemas were written against
    date_getter(registry, "getMonth", |d| JsonValue::from(d.month0()));
    date_getter(registry, "getDate", |d| JsonValue::from(d.day()));
    date_getter(registry, "getDay", |d| JsonValue::from(d.weekday().num_days_from_sunday()));
    date_getter(registry, "getHours", |d| JsonValue::from(d.hour()));
    date_getter(registry, "getMinutes", |d| JsonValue::from(d.minute()));
    date_getter(registry, "getSeconds", |d| JsonValue::from(d.second()));
    date_getter(registry, "getMilliseconds", |d| JsonValue::from(d.timestamp_subsec_millis()));

    registry.register("Date.format", |input: &HandlerInput, args: &[JsonValue]| {
        let format = arg_str(args, 0, "Date.format")?;
        let items: Vec<Item> = StrftimeItems::new(format).collect();
        if items.iter().any(|item| matches!(item, Item::Error)) {
            return Err(HandlerError::InvalidArgs {
                handler: "Date.format".to_string(),
                reason: format!("invalid format string {:?}", format),
            });
        }
        let date = input.as_date()?;
        Ok(JsonValue::from(date.format_with_items(items.iter()).to_string()))
    });
}

fn register_string_natives(registry: &mut HandlerRegistry) {
    registry.register("String.toString", |input: &HandlerInput, _args: &[JsonValue]| {
        Ok(JsonValue::from(input.as_text()))
    });
    registry.register("String.toUpperCase", |input: &HandlerInput, _args: &[JsonValue]| {
        Ok(JsonValue::from(input.as_text().to_uppercase()))
    });
    registry.register("String.toLowerCase", |input: &HandlerInput, _args: &[JsonValue]| {
        Ok(JsonValue::from(input.as_text().to_lowercase()))
    });
    registry.register("String.trim", |input: &HandlerInput, _args: &[JsonValue]| {
        Ok(JsonValue::from(input.as_text().trim()))
    });
    registry.register("String.substring", |input: &HandlerInput, args: &[JsonValue]| {
        let chars: Vec<char> = input.as_text().chars().collect();
        let len = chars.len() as i64;
        let start = arg_i64(args, 0, "String.substring")?.unwrap_or(0).clamp(0, len);
        let end = arg_i64(args, 1, "String.substring")?.unwrap_or(len).clamp(0, len);
        let (from, to) = if start <= end { (start, end) } else { (end, start) };
        Ok(JsonValue::from(chars[from as usize..to as usize].iter().collect::<String>()))
    });
    registry.register("String.slice", |input: &HandlerInput, args: &[JsonValue]| {
        let chars: Vec<char> = input.as_text().chars().collect();
        let len = chars.len();
        let start = relative_index(arg_i64(args, 0, "String.slice")?.unwrap_or(0), len);
        let end = relative_index(arg_i64(args, 1, "String.slice")?.unwrap_or(len as i64), len);
        if start >= end {
            return Ok(JsonValue::from(""));
        }
        Ok(JsonValue::from(chars[start..end].iter().collect::<String>()))
    });
    registry.register("String.replace", |input: &HandlerInput, args: &[JsonValue]| {
        let pattern = arg_str(args, 0, "String.replace")?;
        let replacement = arg_str(args, 1, "String.replace")?;
        Ok(JsonValue::from(input.as_text().replacen(pattern, replacement, 1)))
    });
    registry.register("String.replaceAll", |input: &HandlerInput, args: &[JsonValue]| {
        let pattern = arg_str(args, 0, "String.replaceAll")?;
        let replacement = arg_str(args, 1, "String.replaceAll")?;
        Ok(JsonValue::from(input.as_text().replace(pattern, replacement)))
    });
    registry.register("String.split", |input: &HandlerInput, args: &[JsonValue]| {
        let separator = arg_str(args, 0, "String.split")?;
        let text = input.as_text();
        let parts: Vec<JsonValue> = if separator.is_empty() {
            text.chars().map(|c| JsonValue::from(c.to_string())).collect()
        } else {
            text.split(separator).map(JsonValue::from).collect()
        };
        Ok(JsonValue::Array(parts))
    });
    registry.register("String.padStart", |input: &HandlerInput, args: &[JsonValue]| {
        let target = arg_i64(args, 0, "String.padStart")?.unwrap_or(0).max(0) as usize;
        if target > MAX_PAD_LENGTH {
            return Err(HandlerError::InvalidArgs {
                handler: "String.padStart".to_string(),
                reason: format!("target length {} exceeds {}", target, MAX_PAD_LENGTH),
            });
        }
        let fill = args.get(1).and_then(|v| v.as_str()).unwrap_or(" ");
        let text = input.as_text();
        let missing = target.saturating_sub(text.chars().count());
        if missing == 0 || fill.is_empty() {
            return Ok(JsonValue::from(text));
        }
        let padding: String = fill.chars().cycle().take(missing).collect();
        Ok(JsonValue::from(padding + &text))
    });
    registry.register("String.concat", |input: &HandlerInput, args: &[JsonValue]| {
        let mut text = input.as_text();
        for arg in args {
            text.push_str(&coerce_text(arg));
        }
        Ok(JsonValue::from(text))
    });
    registry.register("String.includes", |input: &HandlerInput, args: &[JsonValue]| {
        Ok(JsonValue::from(input.as_text().contains(arg_str(args, 0, "String.includes")?)))
    });
    registry.register("String.startsWith", |input: &HandlerInput, args: &[JsonValue]| {
        Ok(JsonValue::from(input.as_text().starts_with(arg_str(args, 0, "String.startsWith")?)))
    });
    registry.register("String.endsWith", |input: &HandlerInput, args: &[JsonValue]| {
        Ok(JsonValue::from(input.as_text().ends_with(arg_str(args, 0, "String.endsWith")?)))
    });
}

fn register_helpers(registry: &mut HandlerRegistry) {
    registry.register_helper("monthName", |input: &HandlerInput, _args: &[JsonValue]| {
        Ok(JsonValue::from(input.as_date()?.format("%B").to_string()))
    });
    registry.register_helper("weekdayName", |input: &HandlerInput, _args: &[JsonValue]| {
        Ok(JsonValue::from(input.as_date()?.format("%A").to_string()))
    });
    registry.register_helper("dateOnly", |input: &HandlerInput, _args: &[JsonValue]| {
        Ok(JsonValue::from(input.as_date()?.format("%Y-%m-%d").to_string()))
    });
    registry.register_helper("epochSeconds", |input: &HandlerInput, _args: &[JsonValue]| {
        Ok(JsonValue::from(input.as_date()?.timestamp()))
    });
    registry.register_helper("toNumber", |input: &HandlerInput, _args: &[JsonValue]| {
        let text = input.as_text();
        let trimmed = text.trim();
        if let Ok(int) = trimmed.parse::<i64>() {
            return Ok(JsonValue::from(int));
        }
        trimmed
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(JsonValue::Number))
            .ok_or(HandlerError::Coercion {
                value: text.clone(),
                target: "Number",
            })
    });
}
