/// Live transport over a core NATS connection
///
/// Topics map to NATS subjects, `call` is a NATS request/reply with a JSON
/// body, and every message payload must be a JSON document

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use std::sync::RwLock;
use crate::error::TransportError;
use crate::transport::{EventStream, LiveTransport};

pub struct NatsTransport {
    url: String,
    client: RwLock<Option<async_nats::Client>>,
}

impl NatsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: RwLock::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn client(&self) -> Result<async_nats::Client, TransportError> {
        self.client
            .read()
            .map_err(|_| TransportError::NotOpen)?
            .clone()
            .ok_or(TransportError::NotOpen)
    }
}

fn decode(payload: &[u8]) -> Result<JsonValue, TransportError> {
    serde_json::from_slice(payload).map_err(|e| TransportError::Payload(e.to_string()))
}

#[async_trait]
impl LiveTransport for NatsTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let client = async_nats::connect(&self.url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::info!("Connected to NATS at {}", self.url);

        let mut slot = self
            .client
            .write()
            .map_err(|_| TransportError::Connect("client lock poisoned".to_string()))?;
        *slot = Some(client);
        Ok(())
    }

    async fn on(&self, topic: &str) -> Result<EventStream, TransportError> {
        let client = self.client()?;

        let subscriber = client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        Ok(subscriber.map(|message| decode(&message.payload)).boxed())
    }

    async fn call(&self, method: &str, args: JsonValue) -> Result<JsonValue, TransportError> {
        let client = self.client()?;

        let payload = serde_json::to_vec(&args)
            .map_err(|e| TransportError::Payload(e.to_string()))?;

        let reply = client
            .request(method.to_string(), payload.into())
            .await
            .map_err(|e| TransportError::Call {
                method: method.to_string(),
                reason: e.to_string(),
            })?;

        if reply.payload.is_empty() {
            return Ok(JsonValue::Null);
        }
        decode(&reply.payload)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let client = match self.client.write() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };

        // Dropping the last client handle closes the connection and ends subscriptions
        if let Some(client) = client {
            client.flush().await.map_err(|e| TransportError::Call {
                method: "flush".to_string(),
                reason: e.to_string(),
            })?;
            tracing::info!("Closed NATS connection to {}", self.url);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode(br#"{"id": "E1"}"#), Ok(json!({"id": "E1"})));
        assert!(matches!(decode(b"not json"), Err(TransportError::Payload(_))));
    }

    #[tokio::test]
    async fn test_calls_before_open_fail() {
        let transport = NatsTransport::new("nats://localhost:4222");

        assert!(matches!(transport.on("message").await, Err(TransportError::NotOpen)));
        assert_eq!(transport.call("login", json!({})).await, Err(TransportError::NotOpen));
        assert_eq!(transport.close().await, Ok(()));
    }
}
