//! Process-wide tracing setup shared by every taskforge binary and test.

/// Initialize process-wide logging with the defaults
/// (JSON lines, `RUST_LOG` or `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&LogConfig::default());
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat};
