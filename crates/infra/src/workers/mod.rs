//! Background consumers.

pub mod projection_worker;
pub mod source;

pub use projection_worker::{DeliveryOutcome, ProjectionWorker, WorkerConfig, WorkerHandle};
pub use source::{Delivery, EventSource, SourceError, SubscriptionSource};
