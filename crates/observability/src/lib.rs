//! Tracing/logging setup shared by the nomflow binaries.

/// Initialize process-wide tracing with the default filter (`info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(tracing::DEFAULT_FILTER);
}

/// Tracing configuration (filters, output format).
pub mod tracing;
