//! Tracing and logging setup shared by the binaries.

/// Initialize process-wide logging.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init(config: &LogConfig) {
    tracing::init(config);
}

/// Tracing subscriber configuration.
pub mod tracing;

pub use tracing::{LogConfig, LogFormat};
