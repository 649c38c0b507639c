/// NATS JetStream publisher for composed documents
///
/// Provides connection management and durable publishing of stream envelopes

use async_nats::jetstream;
use std::time::Duration;
use crate::error::TransportError;
use crate::nats::envelope::StreamEnvelope;

#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    pub stream_name: String,
    pub subject_prefix: String,
    pub max_age: Duration,
    pub max_bytes: i64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            stream_name: std::env::var("NATS_STREAM")
                .unwrap_or_else(|_| "BROKER".to_string()),
            subject_prefix: std::env::var("NATS_SUBJECT_PREFIX")
                .unwrap_or_else(|_| "broker.stream".to_string()),
            max_age: Duration::from_secs(24 * 60 * 60), // 24 hours
            max_bytes: 1024 * 1024 * 1024, // 1GB
        }
    }
}

impl NatsConfig {
    /// Subject a source's documents are published on
    pub fn subject_for(&self, source: &str) -> String {
        format!("{}.{}", self.subject_prefix, source)
    }
}

#[derive(Clone)]
pub struct NatsPublisher {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
}

impl NatsPublisher {
    /// Connect to NATS and make sure the broker stream exists
    pub async fn connect(config: NatsConfig) -> Result<Self, TransportError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::info!("Connected to NATS at {}", config.url);

        let jetstream = jetstream::new(client.clone());

        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream_name.clone(),
                subjects: vec![format!("{}.>", config.subject_prefix)],
                max_age: config.max_age,
                max_bytes: config.max_bytes,
                storage: jetstream::stream::StorageType::File,
                num_replicas: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        tracing::info!("JetStream stream '{}' ready", config.stream_name);

        Ok(Self {
            client,
            jetstream,
            config,
        })
    }

    /// Publish an envelope and wait for the JetStream acknowledgment
    pub async fn publish(&self, envelope: &StreamEnvelope) -> Result<(), TransportError> {
        let subject = self.config.subject_for(&envelope.source);

        let payload = serde_json::to_vec(envelope)
            .map_err(|e| TransportError::Payload(e.to_string()))?;

        let publish_error = |reason: String| TransportError::Publish {
            subject: subject.clone(),
            reason,
        };

        let ack = self.jetstream
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        ack.await.map_err(|e| publish_error(e.to_string()))?;

        tracing::debug!(
            "Published document {} to JetStream subject {}",
            envelope.message_id,
            subject
        );

        Ok(())
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    /// Check if the NATS connection is active
    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}
