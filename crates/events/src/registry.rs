//! Explicit `event_type` → decoder mapping for one aggregate kind.
//!
//! Each aggregate kind owns a closed event enum. The registry is the only place
//! where the string discriminator is turned back into a typed variant, so an
//! unknown discriminator surfaces as an error instead of a silent skip.

use std::collections::HashMap;

use thiserror::Error;

/// Decodes a stored payload into a typed event variant.
///
/// Non-capturing closures coerce to this type, e.g.
/// `|bytes| serde_json::from_slice(bytes).map(OrderEvent::Created)`.
pub type Decoder<E> = fn(&[u8]) -> Result<E, serde_json::Error>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("failed to decode {event_type}: {source}")]
    Decode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("event type registered twice: {0}")]
    DuplicateEventType(String),
}

pub struct EventRegistry<E> {
    decoders: HashMap<&'static str, Decoder<E>>,
}

impl<E> EventRegistry<E> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    pub fn register(&mut self, event_type: &'static str, decoder: Decoder<E>) -> Result<(), RegistryError> {
        if self.decoders.contains_key(event_type) {
            return Err(RegistryError::DuplicateEventType(event_type.to_string()));
        }
        self.decoders.insert(event_type, decoder);
        Ok(())
    }

    /// Builder-style `register`.
    pub fn with(mut self, event_type: &'static str, decoder: Decoder<E>) -> Result<Self, RegistryError> {
        self.register(event_type, decoder)?;
        Ok(self)
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    pub fn decode(&self, event_type: &str, payload: &[u8]) -> Result<E, RegistryError> {
        let decoder = self
            .decoders
            .get(event_type)
            .ok_or_else(|| RegistryError::UnknownEventType(event_type.to_string()))?;

        decoder(payload).map_err(|source| RegistryError::Decode {
            event_type: event_type.to_string(),
            source,
        })
    }
}

impl<E> Default for EventRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> core::fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<_> = self.decoders.keys().collect();
        types.sort();
        f.debug_struct("EventRegistry").field("event_types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Sample {
        Named(String),
        Counted(u32),
    }

    fn registry() -> EventRegistry<Sample> {
        EventRegistry::new()
            .with("sample.named", |b| serde_json::from_slice(b).map(Sample::Named))
            .unwrap()
            .with("sample.counted", |b| serde_json::from_slice(b).map(Sample::Counted))
            .unwrap()
    }

    #[test]
    fn decodes_registered_types() {
        let r = registry();
        assert_eq!(r.decode("sample.named", b"\"x\"").unwrap(), Sample::Named("x".into()));
        assert_eq!(r.decode("sample.counted", b"7").unwrap(), Sample::Counted(7));
    }

    #[test]
    fn unknown_type_is_an_error() {
        let r = registry();
        assert!(matches!(
            r.decode("sample.unknown", b"{}"),
            Err(RegistryError::UnknownEventType(t)) if t == "sample.unknown"
        ));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let r = registry();
        assert!(matches!(
            r.decode("sample.counted", b"\"seven\""),
            Err(RegistryError::Decode { .. })
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut r = registry();
        let err = r.register("sample.named", |b| serde_json::from_slice(b).map(Sample::Named));
        assert!(matches!(err, Err(RegistryError::DuplicateEventType(_))));
    }
}
