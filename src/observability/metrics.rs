//! Metrics collection using metrics-rs.

use metrics::{Counter, Gauge, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const BUFFERS_ALLOCATED: &str = "kmsalloc_buffers_allocated";
const BUFFERS_IMPORTED: &str = "kmsalloc_buffers_imported";
const BUFFERS_DESTROYED: &str = "kmsalloc_buffers_destroyed";
const BYTES_ALLOCATED: &str = "kmsalloc_bytes_allocated";
const LIVE_BUFFERS: &str = "kmsalloc_live_buffers";
const FRAMEBUFFERS_ATTACHED: &str = "kmsalloc_framebuffers_attached";
const FLIPS: &str = "kmsalloc_flips";
const POST_LATENCY_NS: &str = "kmsalloc_post_latency_ns";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(BUFFERS_ALLOCATED, Unit::Count, "Buffers created");
    metrics::describe_counter!(
        BUFFERS_IMPORTED,
        Unit::Count,
        "Buffers registered from foreign handles"
    );
    metrics::describe_counter!(
        BUFFERS_DESTROYED,
        Unit::Count,
        "Buffers whose last reference was released"
    );
    metrics::describe_counter!(
        BYTES_ALLOCATED,
        Unit::Bytes,
        "Bytes requested from the kernel"
    );
    metrics::describe_gauge!(LIVE_BUFFERS, Unit::Count, "Entries in the handle registry");
    metrics::describe_counter!(
        FRAMEBUFFERS_ATTACHED,
        Unit::Count,
        "Framebuffer registrations"
    );
    metrics::describe_counter!(FLIPS, Unit::Count, "Modesets and page flips issued");
    metrics::describe_histogram!(
        POST_LATENCY_NS,
        Unit::Nanoseconds,
        "Time spent presenting a buffer"
    );
}

/// Metrics handles for one device, labelled by its connection.
#[derive(Clone)]
pub struct DeviceMetrics {
    allocated: Counter,
    imported: Counter,
    destroyed: Counter,
    bytes: Counter,
    live: Gauge,
    framebuffers: Counter,
    flips: Counter,
    post_latency: Histogram,
}

impl DeviceMetrics {
    /// Create the handles for device `fd`.
    pub fn new(fd: i32) -> Self {
        let device = fd.to_string();
        Self {
            allocated: counter!(BUFFERS_ALLOCATED, "device" => device.clone()),
            imported: counter!(BUFFERS_IMPORTED, "device" => device.clone()),
            destroyed: counter!(BUFFERS_DESTROYED, "device" => device.clone()),
            bytes: counter!(BYTES_ALLOCATED, "device" => device.clone()),
            live: gauge!(LIVE_BUFFERS, "device" => device.clone()),
            framebuffers: counter!(FRAMEBUFFERS_ATTACHED, "device" => device.clone()),
            flips: counter!(FLIPS, "device" => device.clone()),
            post_latency: histogram!(POST_LATENCY_NS, "device" => device),
        }
    }

    /// Record a buffer allocation of `bytes`.
    #[inline]
    pub fn record_allocated(&self, bytes: usize) {
        self.allocated.increment(1);
        self.bytes.increment(bytes as u64);
    }

    /// Record an import.
    #[inline]
    pub fn record_imported(&self) {
        self.imported.increment(1);
    }

    /// Record a teardown.
    #[inline]
    pub fn record_destroyed(&self) {
        self.destroyed.increment(1);
    }

    /// Publish the current registry size.
    #[inline]
    pub fn set_live(&self, live: usize) {
        self.live.set(live as f64);
    }

    /// Record a framebuffer registration.
    #[inline]
    pub fn record_framebuffer(&self) {
        self.framebuffers.increment(1);
    }

    /// Record a presentation and its latency.
    #[inline]
    pub fn record_flip(&self, latency: Duration) {
        self.flips.increment(1);
        self.post_latency.record(latency.as_nanos() as f64);
    }

    /// Start a timer that records a flip when dropped.
    pub fn start_post(&self) -> PostTimer<'_> {
        PostTimer {
            start: Instant::now(),
            metrics: self,
            completed: false,
        }
    }
}

impl std::fmt::Debug for DeviceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMetrics").finish_non_exhaustive()
    }
}

/// Guard that records post latency when dropped, if marked complete.
pub struct PostTimer<'a> {
    start: Instant,
    metrics: &'a DeviceMetrics,
    completed: bool,
}

impl PostTimer<'_> {
    /// Mark the presentation as successful.
    pub fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for PostTimer<'_> {
    fn drop(&mut self) {
        if self.completed {
            self.metrics.record_flip(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_device_metrics() {
        // Should not panic without a recorder installed
        let metrics = DeviceMetrics::new(3);
        metrics.record_allocated(4096);
        metrics.record_imported();
        metrics.record_destroyed();
        metrics.set_live(2);
        metrics.record_framebuffer();
        metrics.record_flip(Duration::from_micros(16));
    }

    #[test]
    fn test_post_timer() {
        let metrics = DeviceMetrics::new(4);
        {
            let timer = metrics.start_post();
            std::thread::sleep(Duration::from_millis(1));
            timer.complete();
        }
        let _abandoned = metrics.start_post();
    }
}
