//! Tracing and logging setup shared by genq binaries.

/// Initialize process-wide tracing.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (format, filters).
pub mod tracing;

pub use self::tracing::{LogFormat, UnknownLogFormat};
