//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! kmsalloc exposes the following metrics, labelled by `device`:
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `kmsalloc_buffers_allocated` | Counter | Buffers created on this device |
//! | `kmsalloc_buffers_imported` | Counter | Buffers registered from foreign handles |
//! | `kmsalloc_buffers_destroyed` | Counter | Buffers whose last reference was released |
//! | `kmsalloc_bytes_allocated` | Counter | Bytes requested from the kernel |
//! | `kmsalloc_live_buffers` | Gauge | Entries in the handle registry |
//! | `kmsalloc_framebuffers_attached` | Counter | Framebuffer registrations |
//! | `kmsalloc_flips` | Counter | Presentations (modesets and flips) |
//! | `kmsalloc_post_latency_ns` | Histogram | Time spent in `post` |
//!
//! ## Tracing
//!
//! kmsalloc emits spans for device operations, buffer operations and
//! scanout transitions, plus debug events for buffer lifetimes.
//!
//! ## Example
//!
//! ```rust,ignore
//! use kmsalloc::observability::init_metrics;
//!
//! // Call once at startup, then install any metrics exporter.
//! init_metrics();
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{DeviceMetrics, PostTimer, init_metrics};
pub use tracing_support::{
    TracingConfig, instrument_buffer, instrument_device, span_buffer, span_device, span_scanout,
    trace_buffer_created, trace_buffer_destroyed, trace_buffer_imported, trace_error,
    trace_scanout_state,
};
