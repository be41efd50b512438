use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use chronicle_core::AggregateId;

use crate::registry::{EventRegistry, RegistryError};

/// Typed envelope for a committed event.
///
/// This is the unit that crosses the broker and enters the retry ledger.
///
/// Notes:
/// - `event_type` is kept next to the payload so consumers can route without decoding.
/// - `version` is the event's position in the aggregate stream (1-based).
/// - `payload` holds the raw bytes written to the ledger; they are decoded into
///   a concrete variant only at the point of application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "wire::WireEnvelope", try_from = "wire::WireEnvelope")]
pub struct EventEnvelope {
    event_type: String,
    aggregate_id: AggregateId,
    version: u64,
    occurred_at: DateTime<Utc>,
    payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("failed to decode envelope: {0}")]
    Decode(String),
}

impl EventEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: AggregateId,
        version: u64,
        occurred_at: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_id,
            version,
            occurred_at,
            payload,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload into the registry's event type.
    pub fn decode_with<E>(&self, registry: &EventRegistry<E>) -> Result<E, RegistryError> {
        registry.decode(&self.event_type, &self.payload)
    }

    /// Wire encoding.
    ///
    /// A payload that is exactly one JSON value goes out verbatim under
    /// `payload`; any other bytes go out base64-encoded under `payload_b64`.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }
}

mod wire {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use serde_json::value::RawValue;

    use chronicle_core::AggregateId;

    use super::EventEnvelope;

    #[derive(Serialize, Deserialize)]
    pub struct WireEnvelope {
        event_type: String,
        aggregate_id: AggregateId,
        version: u64,
        occurred_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Box<RawValue>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload_b64: Option<String>,
    }

    /// `Some` only if `bytes` is one JSON value with nothing around it, so the
    /// embedded form decodes back to identical bytes. `null` is excluded: it
    /// reads back as an absent field.
    fn embeddable(bytes: &[u8]) -> Option<Box<RawValue>> {
        let text = std::str::from_utf8(bytes).ok()?;
        let raw: Box<RawValue> = serde_json::from_str(text).ok()?;
        (raw.get().len() == text.len() && raw.get() != "null").then_some(raw)
    }

    impl From<EventEnvelope> for WireEnvelope {
        fn from(envelope: EventEnvelope) -> Self {
            let (payload, payload_b64) = match embeddable(&envelope.payload) {
                Some(raw) => (Some(raw), None),
                None => (None, Some(STANDARD.encode(&envelope.payload))),
            };
            Self {
                event_type: envelope.event_type,
                aggregate_id: envelope.aggregate_id,
                version: envelope.version,
                occurred_at: envelope.occurred_at,
                payload,
                payload_b64,
            }
        }
    }

    impl TryFrom<WireEnvelope> for EventEnvelope {
        type Error = String;

        fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
            let payload = match (wire.payload, wire.payload_b64) {
                (Some(raw), None) => raw.get().as_bytes().to_vec(),
                (None, Some(encoded)) => STANDARD
                    .decode(encoded)
                    .map_err(|e| format!("invalid payload_b64: {e}"))?,
                (Some(_), Some(_)) => return Err("both payload and payload_b64 present".to_string()),
                (None, None) => return Err("missing payload".to_string()),
            };
            Ok(Self {
                event_type: wire.event_type,
                aggregate_id: wire.aggregate_id,
                version: wire.version,
                occurred_at: wire.occurred_at,
                payload,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(payload: &str) -> EventEnvelope {
        EventEnvelope::new(
            "orders.order.created",
            AggregateId::new("A1").unwrap(),
            1,
            Utc::now(),
            payload.as_bytes().to_vec(),
        )
    }

    #[test]
    fn payload_is_embedded_as_json_not_bytes() {
        let env = envelope(r#"{"order_id":"A1"}"#);
        let wire = String::from_utf8(env.encode().unwrap()).unwrap();
        assert!(wire.contains(r#""payload":{"order_id":"A1"}"#), "wire: {wire}");

        let back = EventEnvelope::decode(wire.as_bytes()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn opaque_payload_travels_as_base64() {
        let env = EventEnvelope::new(
            "orders.order.created",
            AggregateId::new("A1").unwrap(),
            1,
            Utc::now(),
            vec![0xde, 0xad, 0xbe, 0xef],
        );
        let wire = String::from_utf8(env.encode().unwrap()).unwrap();
        assert!(wire.contains(r#""payload_b64":"3q2+7w==""#), "wire: {wire}");
        assert!(!wire.contains(r#""payload":"#), "wire: {wire}");

        assert_eq!(EventEnvelope::decode(wire.as_bytes()).unwrap(), env);
    }

    #[test]
    fn payload_bytes_survive_exactly() {
        for payload in ["not json", " {\"a\":1} ", "null", "", "{\"a\":1}\n"] {
            let env = envelope(payload);
            let back = EventEnvelope::decode(&env.encode().unwrap()).unwrap();
            assert_eq!(back.payload(), payload.as_bytes(), "payload {payload:?}");
        }
    }

    #[test]
    fn envelope_without_payload_is_rejected() {
        let wire = r#"{"event_type":"x","aggregate_id":"A1","version":1,"occurred_at":"2024-01-01T00:00:00Z"}"#;
        assert!(matches!(EventEnvelope::decode(wire.as_bytes()), Err(EnvelopeError::Decode(_))));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            EventEnvelope::decode(b"{\"event_type\":1}"),
            Err(EnvelopeError::Decode(_))
        ));
    }
}
