//! Process-wide tracing setup shared by the binaries.

/// Initialize process-wide tracing from the environment.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (format, filter).
pub mod tracing;

pub use tracing::{LogFormat, init_with};
