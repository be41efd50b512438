//! Append-only event ledger boundary.
//!
//! The ledger is the authority for optimistic concurrency: `append` is a
//! compare-and-append on `(aggregate_id, version)`, and nothing else in the
//! system locks an aggregate.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, NewEvent, StoredEvent};
