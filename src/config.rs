//! Device configuration and default constants.
//!
//! # Usage
//!
//! ```rust
//! use kmsalloc::config::DeviceConfig;
//!
//! let config = DeviceConfig::default().with_stride_alignment(256);
//! assert_eq!(config.stride_alignment, 256);
//! ```

use crate::error::{Error, Result};
use crate::observability::TracingConfig;

// =============================================================================
// Defaults
// =============================================================================

/// Row pitch alignment in bytes. Matches what most display engines require.
pub const DEFAULT_STRIDE_ALIGNMENT: u32 = 64;

/// Largest width or height accepted for allocation.
pub const DEFAULT_MAX_DIMENSION: u32 = 8192;

/// Magic number at the start of every encoded handle ("KMSB").
pub const HANDLE_MAGIC: u32 = 0x4B4D_5342;

/// Current encoded handle version.
pub const HANDLE_VERSION: u16 = 1;

// =============================================================================
// DeviceConfig
// =============================================================================

/// Allocation policy for a [`Device`](crate::Device).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Every stride is rounded up to this many bytes (power of two).
    pub stride_alignment: u32,
    /// Largest width or height accepted by `create`.
    pub max_dimension: u32,
    /// Span configuration.
    pub tracing: TracingConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            stride_alignment: DEFAULT_STRIDE_ALIGNMENT,
            max_dimension: DEFAULT_MAX_DIMENSION,
            tracing: TracingConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Tightly packed rows (stride = width × bpp), useful for software
    /// consumers that expect no padding.
    pub fn packed() -> Self {
        Self {
            stride_alignment: 1,
            ..Self::default()
        }
    }

    /// Set the stride alignment.
    pub fn with_stride_alignment(mut self, alignment: u32) -> Self {
        self.stride_alignment = alignment;
        self
    }

    /// Set the maximum width/height.
    pub fn with_max_dimension(mut self, max: u32) -> Self {
        self.max_dimension = max;
        self
    }

    /// Set the span configuration.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    /// Check the configuration for values the allocator cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !self.stride_alignment.is_power_of_two() {
            return Err(Error::InvalidGeometry(format!(
                "stride alignment {} is not a power of 2",
                self.stride_alignment
            )));
        }
        if self.max_dimension == 0 {
            return Err(Error::InvalidGeometry("max dimension must be > 0".into()));
        }
        Ok(())
    }
}
