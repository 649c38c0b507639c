//! Broker configuration.
//!
//! Loaded from a YAML file, then overlaid with environment variables
//! (`NATS_URL`, `BROKER_PORT`, `SCHEMA_DIR`).
//!
//! ```yaml
//! port: 8080
//! schema_dir: schemas
//! sources:
//!   - id: kone
//!     url: nats://localhost:4222
//!     topics: [kone.elevators.>]
//!     identity_field: unitId
//!     handshake: { method: kone.login, args: { user: broker } }
//!     schema: elevator
//!     consumers: [log, nats-publish]
//! ```

use crate::dispatcher::DispatcherOptions;
use crate::error::ConfigError;
use crate::extraction::FieldPath;
use crate::nats::NatsConfig;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TOPIC: &str = "message";
pub const DEFAULT_IDENTITY_FIELD: &str = "id";
pub const DEFAULT_GRACE_DELAY_MS: u64 = 2000;
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PORT: u16 = 8080;

fn default_topics() -> Vec<String> {
    vec![DEFAULT_TOPIC.to_string()]
}

fn default_identity_field() -> String {
    DEFAULT_IDENTITY_FIELD.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_grace_delay_ms() -> u64 {
    DEFAULT_GRACE_DELAY_MS
}

fn default_send_timeout_secs() -> u64 {
    DEFAULT_SEND_TIMEOUT_SECS
}

/// Call made right after a connection opens, e.g. a login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    pub method: String,
    #[serde(default)]
    pub args: JsonValue,
}

/// One live source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source identifier (product code)
    pub id: String,

    #[serde(default)]
    pub url: String,

    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Path to the entity id inside an event
    #[serde(default = "default_identity_field")]
    pub identity_field: String,

    #[serde(default)]
    pub handshake: Option<HandshakeConfig>,

    /// Schema catalog entry used to compose output documents
    #[serde(default)]
    pub schema: Option<String>,

    /// Stream consumers fed on every event
    #[serde(default)]
    pub consumers: Vec<String>,

    /// Per-consumer options, keyed by consumer name
    #[serde(default)]
    pub plugins: IndexMap<String, JsonValue>,
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            topics: default_topics(),
            identity_field: default_identity_field(),
            handshake: None,
            schema: None,
            consumers: Vec::new(),
            plugins: IndexMap::new(),
        }
    }

    /// Subscribed topics, falling back to the default topic.
    pub fn topics(&self) -> Vec<String> {
        if self.topics.is_empty() {
            default_topics()
        } else {
            self.topics.clone()
        }
    }

    /// Entity id of an event: the identity field when present, else the topic.
    pub fn entity_id(&self, event: &JsonValue, topic: &str) -> String {
        match FieldPath::from_dotted(&self.identity_field).lookup(event) {
            Some(JsonValue::String(id)) if !id.is_empty() => id.clone(),
            Some(JsonValue::Number(id)) => id.to_string(),
            _ => topic.to_string(),
        }
    }

    /// Options configured for one consumer, `null` when absent.
    pub fn plugin_options(&self, consumer: &str) -> JsonValue {
        self.plugins.get(consumer).cloned().unwrap_or(JsonValue::Null)
    }
}

/// Top-level broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub schema_dir: Option<PathBuf>,

    /// NATS server used for publishing composed documents
    #[serde(default)]
    pub nats_url: Option<String>,

    #[serde(default)]
    pub stream_name: Option<String>,

    #[serde(default = "default_grace_delay_ms")]
    pub grace_delay_ms: u64,

    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            schema_dir: None,
            nats_url: None,
            stream_name: None,
            grace_delay_ms: DEFAULT_GRACE_DELAY_MS,
            send_timeout_secs: DEFAULT_SEND_TIMEOUT_SECS,
            sources: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Arguments
    /// * `path` - Path to broker.yaml
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is not valid YAML
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Load from file and apply the process environment on top.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay settings from a key lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("NATS_URL") {
            self.nats_url = Some(url);
        }
        if let Some(port) = lookup("BROKER_PORT") {
            self.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "BROKER_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(dir) = lookup("SCHEMA_DIR") {
            self.schema_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|source| source.id == id)
    }

    pub fn dispatcher_options(&self) -> DispatcherOptions {
        DispatcherOptions {
            grace_delay: Duration::from_millis(self.grace_delay_ms),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
        }
    }

    /// NATS settings for publishing, starting from the environment defaults.
    pub fn nats_config(&self) -> NatsConfig {
        let mut nats = NatsConfig::default();
        if let Some(url) = &self.nats_url {
            nats.url = url.clone();
        }
        if let Some(stream_name) = &self.stream_name {
            nats.stream_name = stream_name.clone();
        }
        nats
    }
}
