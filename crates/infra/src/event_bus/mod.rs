//! Broker transports for committed envelopes.
//!
//! The in-process bus lives in `chronicle_events`; this module adds key-based
//! partitioning and the Redis Streams transport (feature `redis`).

pub mod partition;

#[cfg(feature = "redis")]
pub mod redis_streams;

pub use partition::{partition_for, stream_key, stream_keys};

#[cfg(feature = "redis")]
pub use redis_streams::{
    ReclaimerHandle, RedisStreamsConsumer, RedisStreamsDeadLetterSink, RedisStreamsError, RedisStreamsPublisher,
    dead_letter_key,
};
