//! Events, commands, envelopes, and the publish/subscribe boundary.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod registry;

pub use bus::{EventPublisher, PublishError, Subscription};
pub use command::Command;
pub use envelope::{EnvelopeError, EventEnvelope};
pub use event::Event;
pub use in_memory_bus::InMemoryEventBus;
pub use registry::{Decoder, EventRegistry, RegistryError};
