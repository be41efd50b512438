use chrono::{DateTime, Utc};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **discriminated** by a stable `event_type` string stored next to the payload
/// - designed to be **append-only**
///
/// The payload written to the ledger is the variant's own fields, not the
/// enclosing enum; the discriminator travels separately so a registry can
/// pick the decoder without inspecting the bytes.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "orders.order.created").
    fn event_type(&self) -> &'static str;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Serialize the variant's fields into the stored payload.
    fn encode_payload(&self) -> Result<Vec<u8>, serde_json::Error>;
}
