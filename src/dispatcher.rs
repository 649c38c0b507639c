//! Streaming Cache & Dispatcher.
//!
//! Owns one live connection per configured source. Each inbound event is
//! cached under its entity id, then that entity's output documents are
//! composed with the Schema Transformer and handed to the source's stream
//! consumers. Queries (`get_data`) read the same cache.
//!
//! Connection lifecycle per source:
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> (Receiving <-> Idle) -> Disconnected
//! ```
//!
//! `connect` and `close` run through the [`SerializedQueue`] keyed by source
//! id, so overlapping reconnects cannot leave two live connections behind.

use crate::cache::EntityCache;
use crate::config::{SourceConfig, DEFAULT_GRACE_DELAY_MS, DEFAULT_SEND_TIMEOUT_SECS};
use crate::consumer::{ConsumerRegistry, StreamContext};
use crate::error::{ConnectionError, EventError, SchemaError};
use crate::queue::SerializedQueue;
use crate::schema::{SchemaCatalog, SchemaNode};
use crate::transformer::Transformer;
use crate::transport::{EventStream, LiveTransport, TransportFactory};
use dashmap::DashMap;
use futures::future::join_all;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lifecycle state of a source's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Receiving,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherOptions {
    /// Pause between closing an old connection and opening its replacement
    pub grace_delay: Duration,
    /// How long `send` waits for a reply
    pub send_timeout: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            grace_delay: Duration::from_millis(DEFAULT_GRACE_DELAY_MS),
            send_timeout: Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS),
        }
    }
}

struct ConnectionRecord {
    id: Uuid,
    transport: Arc<dyn LiveTransport>,
    pumps: Vec<JoinHandle<()>>,
}

impl ConnectionRecord {
    async fn shutdown(self, source_id: &str) {
        for pump in &self.pumps {
            pump.abort();
        }
        if let Err(e) = self.transport.close().await {
            tracing::error!("{}: {}", source_id, e);
        }
    }
}

struct Inner {
    sources: DashMap<String, Arc<SourceConfig>>,
    schemas: Arc<SchemaCatalog>,
    transformer: Transformer,
    consumers: Arc<ConsumerRegistry>,
    factory: Arc<dyn TransportFactory>,
    options: DispatcherOptions,
    cache: EntityCache,
    queue: SerializedQueue,
    connections: DashMap<String, ConnectionRecord>,
    states: DashMap<String, ConnectionState>,
}

/// Connection registry, entity cache and event fan-out for all sources.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        schemas: Arc<SchemaCatalog>,
        transformer: Transformer,
        consumers: Arc<ConsumerRegistry>,
        factory: Arc<dyn TransportFactory>,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sources: DashMap::new(),
                schemas,
                transformer,
                consumers,
                factory,
                options,
                cache: EntityCache::new(),
                queue: SerializedQueue::new(),
                connections: DashMap::new(),
                states: DashMap::new(),
            }),
        }
    }

    /// Register (or replace) a source configuration.
    pub fn add_source(&self, source: SourceConfig) {
        self.inner.sources.insert(source.id.clone(), Arc::new(source));
    }

    pub fn source(&self, source_id: &str) -> Result<Arc<SourceConfig>, ConnectionError> {
        self.inner
            .sources
            .get(source_id)
            .map(|source| source.clone())
            .ok_or_else(|| ConnectionError::UnknownSource(source_id.to_string()))
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sources.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn cache(&self) -> &EntityCache {
        &self.inner.cache
    }

    pub fn state(&self, source_id: &str) -> ConnectionState {
        self.inner
            .states
            .get(source_id)
            .map(|state| *state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self, source_id: &str) -> bool {
        self.inner.connections.contains_key(source_id)
    }

    /// Number of live connections across all sources
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// `$id` of the schema configured for a source.
    pub fn schema_id(&self, source_id: &str) -> Option<String> {
        let source = self.source(source_id).ok()?;
        self.resolve_schema(&source).ok()??.id.clone()
    }

    /// Open (or reopen) the live connection of a source.
    ///
    /// An existing connection is closed first and the grace delay observed
    /// before the new one opens. Calls for the same source are serialized.
    pub async fn connect(&self, source_id: &str) -> Result<(), ConnectionError> {
        let source = self.source(source_id)?;
        let this = self.clone();
        self.inner
            .queue
            .enqueue(source_id, move || async move { this.establish(source).await })
            .await
    }

    /// Connect every configured source, concurrently.
    pub async fn connect_all(&self) -> Vec<(String, Result<(), ConnectionError>)> {
        let ids = self.source_ids();
        let results = join_all(ids.iter().map(|id| self.connect(id))).await;
        ids.into_iter().zip(results).collect()
    }

    /// Close a source's connection.
    ///
    /// # Returns
    /// `true` when a live connection was closed
    pub async fn close(&self, source_id: &str) -> bool {
        let this = self.clone();
        let id = source_id.to_string();
        self.inner
            .queue
            .enqueue(source_id, move || async move {
                let Some((_, record)) = this.inner.connections.remove(&id) else {
                    return false;
                };
                tracing::info!("{}: Closing connection.", id);
                record.shutdown(&id).await;
                this.set_state(&id, ConnectionState::Disconnected);
                true
            })
            .await
    }

    async fn establish(&self, source: Arc<SourceConfig>) -> Result<(), ConnectionError> {
        let id = source.id.as_str();

        if let Some((_, previous)) = self.inner.connections.remove(id) {
            tracing::info!("{}: Closing existing connection.", id);
            previous.shutdown(id).await;
            tokio::time::sleep(self.inner.options.grace_delay).await;
        }

        self.set_state(id, ConnectionState::Connecting);
        tracing::info!("{}: Initialize connection.", id);

        let transport = self.inner.factory.create(&source);
        if let Err(error) = transport.open().await {
            return Err(self.fail(ConnectionError::Transport {
                source_id: id.to_string(),
                error,
            }));
        }

        if let Some(handshake) = &source.handshake {
            if let Err(error) = transport.call(&handshake.method, handshake.args.clone()).await {
                if let Err(e) = transport.close().await {
                    tracing::debug!("{}: {}", id, e);
                }
                return Err(self.fail(ConnectionError::Handshake {
                    source_id: id.to_string(),
                    method: handshake.method.clone(),
                    error,
                }));
            }
        }

        let mut streams = Vec::new();
        for topic in source.topics() {
            match transport.on(&topic).await {
                Ok(events) => {
                    tracing::info!("{}: Subscribed to event {}.", id, topic);
                    streams.push((topic, events));
                }
                Err(error) => {
                    if let Err(e) = transport.close().await {
                        tracing::debug!("{}: {}", id, e);
                    }
                    return Err(self.fail(ConnectionError::Transport {
                        source_id: id.to_string(),
                        error,
                    }));
                }
            }
        }

        let connection_id = Uuid::new_v4();
        self.inner.connections.insert(
            id.to_string(),
            ConnectionRecord {
                id: connection_id,
                transport,
                pumps: Vec::new(),
            },
        );
        self.set_state(id, ConnectionState::Subscribed);

        let remaining = Arc::new(AtomicUsize::new(streams.len()));
        for (topic, events) in streams {
            let pump = tokio::spawn(self.clone().pump(
                source.clone(),
                connection_id,
                topic,
                events,
                remaining.clone(),
            ));
            if let Some(mut record) = self.inner.connections.get_mut(id) {
                if record.id == connection_id {
                    record.pumps.push(pump);
                }
            }
        }

        Ok(())
    }

    fn fail(&self, error: ConnectionError) -> ConnectionError {
        let source_id = match &error {
            ConnectionError::Transport { source_id, .. } | ConnectionError::Handshake { source_id, .. } => {
                source_id.as_str()
            }
            ConnectionError::NotConnected(id)
            | ConnectionError::Timeout(id)
            | ConnectionError::UnknownSource(id) => id.as_str(),
        };
        self.set_state(source_id, ConnectionState::Disconnected);
        tracing::error!("{}", error);
        error
    }

    async fn pump(
        self,
        source: Arc<SourceConfig>,
        connection_id: Uuid,
        topic: String,
        mut events: EventStream,
        remaining: Arc<AtomicUsize>,
    ) {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    if let Err(e) = self.handle_event(&source.id, &topic, event).await {
                        tracing::error!("{}", e);
                    }
                }
                Err(e) => tracing::error!("{}: {}", source.id, e),
            }
        }

        tracing::info!("{}: Event stream {} ended.", source.id, topic);
        if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.release(&source.id, connection_id).await;
        }
    }

    /// Drop the connection record once all its streams ended, unless it was
    /// already replaced by a newer connection.
    async fn release(&self, source_id: &str, connection_id: Uuid) {
        let Some((_, record)) = self
            .inner
            .connections
            .remove_if(source_id, |_, record| record.id == connection_id)
        else {
            return;
        };

        self.set_state(source_id, ConnectionState::Disconnected);
        tracing::info!("{}: Connection closed.", source_id);
        if let Err(e) = record.transport.close().await {
            tracing::debug!("{}: {}", source_id, e);
        }
    }

    /// Process one inbound event.
    ///
    /// The event replaces the cached entry of its entity, then every stream
    /// consumer of the source receives that entity's recomposed output
    /// documents. A failing consumer is logged and does not affect the others.
    ///
    /// # Errors
    /// Unknown sources and missing schemas fail before the cache is touched
    pub async fn handle_event(&self, source_id: &str, topic: &str, event: JsonValue) -> Result<(), EventError> {
        let source = self
            .source(source_id)
            .map_err(|_| EventError::UnknownSource(source_id.to_string()))?;
        let schema = self.resolve_schema(&source).map_err(|error| EventError::Schema {
            source_id: source_id.to_string(),
            error,
        })?;

        let entity_id = source.entity_id(&event, topic);
        self.mark_activity(source_id, ConnectionState::Receiving);
        self.inner.cache.upsert(source_id, &entity_id, event);

        if !source.consumers.is_empty() {
            let results = self.compose(source_id, &entity_id, schema.as_deref());
            let schema_id = schema.as_ref().and_then(|schema| schema.id.clone());

            for name in &source.consumers {
                let Some(consumer) = self.inner.consumers.get(name) else {
                    tracing::warn!("{}: Stream consumer {} is not registered.", source_id, name);
                    continue;
                };
                let context = StreamContext {
                    source: source_id.to_string(),
                    topic: topic.to_string(),
                    entity_id: entity_id.clone(),
                    schema_id: schema_id.clone(),
                    options: source.plugin_options(name),
                };
                if let Err(e) = consumer.consume(&context, &results).await {
                    tracing::error!("{}: {}", source_id, e);
                }
            }
        }

        self.mark_activity(source_id, ConnectionState::Idle);
        Ok(())
    }

    /// Compose the output documents of one cached entity.
    ///
    /// Array outputs are flattened into the result list. An entity that is
    /// not cached, or maps to nothing, yields an empty list.
    pub fn compose(&self, source_id: &str, entity_id: &str, schema: Option<&SchemaNode>) -> Vec<JsonValue> {
        let Some(message) = self.inner.cache.get(source_id, entity_id) else {
            return Vec::new();
        };
        let output = match schema {
            Some(schema) => self.inner.transformer.transform(&message, schema),
            None => Some(message),
        };
        match output {
            Some(JsonValue::Array(items)) => items,
            Some(document) => vec![document],
            None => Vec::new(),
        }
    }

    /// Answer point lookups from the cache.
    ///
    /// # Arguments
    /// * `source_id` - Source identifier
    /// * `ids` - Requested entity ids; `prefix#` matches every id with that prefix
    ///
    /// # Returns
    /// Matching cached messages, transformed with the source's schema when
    /// one is configured
    pub fn get_data(&self, source_id: &str, ids: &[String]) -> Result<Vec<JsonValue>, ConnectionError> {
        let source = self.source(source_id)?;
        let schema = match self.resolve_schema(&source) {
            Ok(schema) => schema,
            Err(e) => {
                tracing::warn!("{}: {}; returning raw messages", source_id, e);
                None
            }
        };

        let mut items = Vec::new();
        for requested in ids {
            for hit in self.inner.cache.query(source_id, requested, &source.identity_field) {
                match &schema {
                    Some(schema) => {
                        if let Some(document) = self.inner.transformer.transform(&hit.message, schema) {
                            items.push(document);
                        }
                    }
                    None => items.push(hit.message),
                }
            }
        }
        Ok(items)
    }

    /// Request/reply call on a source's live connection.
    pub async fn send(&self, source_id: &str, method: &str, args: JsonValue) -> Result<JsonValue, ConnectionError> {
        let transport = self
            .inner
            .connections
            .get(source_id)
            .map(|record| record.transport.clone())
            .ok_or_else(|| ConnectionError::NotConnected(source_id.to_string()))?;

        match tokio::time::timeout(self.inner.options.send_timeout, transport.call(method, args)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(error)) => Err(ConnectionError::Transport {
                source_id: source_id.to_string(),
                error,
            }),
            Err(_) => Err(ConnectionError::Timeout(source_id.to_string())),
        }
    }

    fn resolve_schema(&self, source: &SourceConfig) -> Result<Option<Arc<SchemaNode>>, SchemaError> {
        match &source.schema {
            Some(name) => self.inner.schemas.require(name).map(Some),
            None => Ok(None),
        }
    }

    fn set_state(&self, source_id: &str, state: ConnectionState) {
        self.inner.states.insert(source_id.to_string(), state);
    }

    /// Toggle Receiving/Idle, only while a connection is up.
    fn mark_activity(&self, source_id: &str, state: ConnectionState) {
        if let Some(mut current) = self.inner.states.get_mut(source_id) {
            if matches!(
                *current,
                ConnectionState::Subscribed | ConnectionState::Receiving | ConnectionState::Idle
            ) {
                *current = state;
            }
        }
    }
}
