//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create spans for device-level operations.
    pub device_spans: bool,
    /// Whether to create spans for per-buffer operations.
    pub buffer_spans: bool,
    /// Whether to create spans for scanout operations.
    pub scanout_spans: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            device_spans: true,
            buffer_spans: false, // lock/unlock are hot
            scanout_spans: true,
        }
    }
}

impl TracingConfig {
    /// All spans enabled.
    pub fn all() -> Self {
        Self {
            device_spans: true,
            buffer_spans: true,
            scanout_spans: true,
        }
    }

    /// Device spans only.
    pub fn minimal() -> Self {
        Self {
            device_spans: true,
            buffer_spans: false,
            scanout_spans: false,
        }
    }

    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            device_spans: false,
            buffer_spans: false,
            scanout_spans: false,
        }
    }
}

/// Create a span for a device operation.
///
/// # Example
///
/// ```rust,ignore
/// use kmsalloc::observability::span_device;
///
/// let span = span_device(device.fd(), "create");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_device(fd: i32, op: &'static str) -> Span {
    span!(Level::INFO, "device", fd = fd, op = op)
}

/// Create a span for a buffer operation.
#[inline]
pub fn span_buffer(name: u32, op: &'static str) -> Span {
    span!(Level::DEBUG, "buffer", name = name, op = op)
}

/// Create a span for a scanout operation.
#[inline]
pub fn span_scanout(fd: i32, op: &'static str) -> Span {
    span!(Level::DEBUG, "scanout", fd = fd, op = op)
}

/// Enter a device span when `enabled`, otherwise a disabled one.
pub fn instrument_device(enabled: bool, fd: i32, op: &'static str) -> tracing::span::EnteredSpan {
    if enabled {
        span_device(fd, op).entered()
    } else {
        Span::none().entered()
    }
}

/// Enter a buffer span when `enabled`, otherwise a disabled one.
pub fn instrument_buffer(enabled: bool, name: u32, op: &'static str) -> tracing::span::EnteredSpan {
    if enabled {
        span_buffer(name, op).entered()
    } else {
        Span::none().entered()
    }
}

/// Log a buffer allocation.
#[inline]
pub fn trace_buffer_created(name: u32, width: i32, height: i32, format: &str, size: usize) {
    tracing::debug!(
        name = name,
        width = width,
        height = height,
        format = %format,
        size = size,
        "buffer created"
    );
}

/// Log a buffer import.
#[inline]
pub fn trace_buffer_imported(name: u32, size: usize) {
    tracing::debug!(name = name, size = size, "buffer imported");
}

/// Log a buffer teardown.
#[inline]
pub fn trace_buffer_destroyed(name: u32, imported: bool) {
    tracing::debug!(name = name, imported = imported, "buffer destroyed");
}

/// Log an error.
#[inline]
pub fn trace_error(op: &str, error: &dyn std::error::Error) {
    tracing::warn!(op = %op, error = %error, "operation failed");
}

/// Log a scanout state change.
#[inline]
pub fn trace_scanout_state(fd: i32, from: &str, to: &str) {
    tracing::info!(fd = fd, from = %from, to = %to, "scanout state changed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert!(config.device_spans);
        assert!(!config.buffer_spans);
        assert!(config.scanout_spans);
    }

    #[test]
    fn test_tracing_config_presets() {
        let all = TracingConfig::all();
        assert!(all.device_spans && all.buffer_spans && all.scanout_spans);

        let minimal = TracingConfig::minimal();
        assert!(minimal.device_spans);
        assert!(!minimal.buffer_spans);

        let none = TracingConfig::none();
        assert!(!none.device_spans && !none.buffer_spans && !none.scanout_spans);
    }

    #[test]
    fn test_instrumentation() {
        // These should not panic without a subscriber
        let _guard = instrument_device(true, 3, "create");
        let _guard = instrument_buffer(false, 1, "lock");
        let _span = span_scanout(3, "post");
    }

    #[test]
    fn test_trace_functions() {
        trace_buffer_created(1, 64, 64, "RGBA_8888", 16384);
        trace_buffer_imported(1, 16384);
        trace_buffer_destroyed(1, false);
        trace_scanout_state(3, "Uninitialized", "Initialized");
        trace_error("lock", &crate::Error::AlreadyLocked);
    }
}
