//! Stream consumers.
//!
//! A stream consumer receives the composed output documents of a source once
//! per inbound event. Consumers are registered by name at startup and each
//! source lists the names it feeds.

use crate::error::ConsumerError;
use crate::nats::{NatsPublisher, StreamEnvelope};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// What a consumer knows about the event that triggered it.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamContext {
    pub source: String,
    pub topic: String,
    pub entity_id: String,
    /// `$id` of the schema that composed the documents
    pub schema_id: Option<String>,
    /// Options configured for this consumer on the source
    pub options: JsonValue,
}

/// Downstream receiver of composed documents.
#[async_trait]
pub trait StreamConsumer: Send + Sync {
    fn name(&self) -> &str;

    async fn consume(&self, context: &StreamContext, results: &[JsonValue]) -> Result<(), ConsumerError>;
}

/// Named stream consumers, populated at startup.
#[derive(Clone, Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, Arc<dyn StreamConsumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer under its own name, replacing any previous one.
    pub fn register(&mut self, consumer: Arc<dyn StreamConsumer>) {
        self.consumers.insert(consumer.name().to_string(), consumer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StreamConsumer>> {
        self.consumers.get(name).cloned()
    }

    pub fn has_consumer(&self, name: &str) -> bool {
        self.consumers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.consumers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Logs every composed document.
#[derive(Debug, Default)]
pub struct LogConsumer;

impl LogConsumer {
    pub const NAME: &'static str = "log";
}

#[async_trait]
impl StreamConsumer for LogConsumer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn consume(&self, context: &StreamContext, results: &[JsonValue]) -> Result<(), ConsumerError> {
        for document in results {
            tracing::info!(
                source = %context.source,
                entity = %context.entity_id,
                "{}: {}",
                context.topic,
                document
            );
        }
        Ok(())
    }
}

/// Publishes every composed document to NATS JetStream.
pub struct NatsPublishConsumer {
    publisher: NatsPublisher,
}

impl NatsPublishConsumer {
    pub const NAME: &'static str = "nats-publish";

    pub fn new(publisher: NatsPublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl StreamConsumer for NatsPublishConsumer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn consume(&self, context: &StreamContext, results: &[JsonValue]) -> Result<(), ConsumerError> {
        for document in results {
            let envelope = StreamEnvelope::new(
                &context.source,
                &context.topic,
                &context.entity_id,
                document.clone(),
            )
            .with_context(context.schema_id.clone());

            self.publisher
                .publish(&envelope)
                .await
                .map_err(|e| ConsumerError::Failed {
                    name: Self::NAME.to_string(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}
