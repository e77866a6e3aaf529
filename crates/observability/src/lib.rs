//! Tracing/logging setup shared by job workers and tools.

/// Initialize process-wide tracing with the default configuration.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

pub mod tracing;

pub use tracing::{ObservabilityConfig, init_with};
