/// Envelope for composed documents published to NATS
///
/// Wraps one output document with the metadata needed to trace it back to
/// the event that produced it

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    /// Unique id for tracking
    pub message_id: Uuid,

    /// Source identifier the event came from
    pub source: String,

    /// Topic the event arrived on
    pub topic: String,

    /// Entity the event updated
    pub entity_id: String,

    /// `$id` of the schema that composed the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// When the document was composed
    pub emitted_at: DateTime<Utc>,

    /// The composed document
    pub data: JsonValue,
}

impl StreamEnvelope {
    pub fn new(source: &str, topic: &str, entity_id: &str, data: JsonValue) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            source: source.to_string(),
            topic: topic.to_string(),
            entity_id: entity_id.to_string(),
            context: None,
            emitted_at: Utc::now(),
            data,
        }
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_serialization() {
        let envelope = StreamEnvelope::new("kone", "message", "E1", json!({"floor": 3}))
            .with_context(Some("https://schema.example/elevator".to_string()));

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["source"], "kone");
        assert_eq!(value["entity_id"], "E1");
        assert_eq!(value["data"], json!({"floor": 3}));

        let decoded: StreamEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_context_is_optional() {
        let envelope = StreamEnvelope::new("kone", "message", "E1", json!(null));
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("context").is_none());
    }
}
