//! Error types shared across the broker core.
//!
//! Mapping-side errors (`HandlerError`, `TemplateError`, `TransformError`) are
//! recovered locally and only surface in logs. Connection-side errors
//! (`TransportError`, `ConnectionError`) are returned to callers.

use thiserror::Error;

/// Error raised while dispatching a value handler.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error("Handler not found: {0}")]
    NotFound(String),

    #[error("Cannot coerce {value} to {target}")]
    Coercion { value: String, target: &'static str },

    #[error("Invalid arguments for {handler}: {reason}")]
    InvalidArgs { handler: String, reason: String },
}

/// Error raised while substituting placeholders into a template.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    #[error("Placeholder nesting exceeded {0} passes")]
    NestingTooDeep(usize),

    #[error("Unresolved placeholder: ${{{0}}}")]
    Unresolved(String),
}

/// Error raised while loading or compiling schema definitions.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Failed to read schema file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse schema {name}: {reason}")]
    Parse { name: String, reason: String },

    #[error("Schema directory does not exist: {0}")]
    MissingDirectory(String),

    #[error("Schema not found: {0}")]
    NotFound(String),
}

/// Error raised while evaluating a single schema node.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransformError {
    #[error("Schema nesting exceeded depth {0}")]
    DepthExceeded(usize),
}

/// Error reported by a live transport implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Transport is not open")]
    NotOpen,

    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Call {method} failed: {reason}")]
    Call { method: String, reason: String },

    #[error("Publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("Payload is not valid JSON: {0}")]
    Payload(String),
}

/// Error surfaced by the streaming dispatcher's connection lifecycle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectionError {
    #[error("{source_id}: transport failure: {error}")]
    Transport {
        source_id: String,
        error: TransportError,
    },

    #[error("{source_id}: handshake {method} failed: {error}")]
    Handshake {
        source_id: String,
        method: String,
        error: TransportError,
    },

    #[error("{0}: no live connection")]
    NotConnected(String),

    #[error("{0}: no reply before timeout")]
    Timeout(String),

    #[error("{0}: source is not configured")]
    UnknownSource(String),
}

/// Error returned by a stream consumer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConsumerError {
    #[error("Consumer {name} failed: {reason}")]
    Failed { name: String, reason: String },
}

/// Error raised while loading broker configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

/// Error raised while processing one inbound event.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("{0}: source is not configured")]
    UnknownSource(String),

    #[error("{source_id}: {error}")]
    Schema {
        source_id: String,
        #[source]
        error: SchemaError,
    },
}
