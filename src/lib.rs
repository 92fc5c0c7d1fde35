//! # kmsalloc
//!
//! A graphics buffer allocator on top of a kernel mode-setting and memory
//! management subsystem.
//!
//! kmsalloc allocates pixel buffers backed by kernel memory objects, hands
//! out handles that other processes can import, maps buffers for CPU access,
//! and attaches buffers to the display as scanout framebuffers.
//!
//! ## Features
//!
//! - **Explicit devices**: no global state; each [`Device`] is one kernel connection
//! - **Portable handles**: versioned wire format with self-checking metadata
//! - **One wrapper per object**: repeated imports share a reference-counted entry
//! - **Scanout**: framebuffer attach/detach, modeset and page-flip presentation
//! - **Emulated kernel**: memfd-backed stand-in for tests and headless use
//!
//! ## Quick Start
//!
//! ```rust
//! use kmsalloc::prelude::*;
//!
//! let kernel = EmulatedKernel::new(KernelConfig::default().with_refresh_hz(1000));
//! let device = Device::open(kernel.connect()?)?;
//! device.init_kms()?;
//!
//! let bo = device.create_buffer(
//!     640,
//!     480,
//!     PixelFormat::Rgbx8888,
//!     BufferUsage::HW_FB | BufferUsage::SW_WRITE_OFTEN,
//! )?;
//!
//! let pixels = bo.lock(Rect::new(0, 0, 640, 480), true)?;
//! unsafe { pixels.as_ptr().write_bytes(0, bo.stride() as usize * 480) };
//! bo.unlock()?;
//!
//! bo.attach()?;
//! bo.post()?;
//!
//! bo.destroy()?;
//! device.destroy()?;
//! # Ok::<(), kmsalloc::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod handle;
pub mod ipc;
pub mod kms;
pub mod memory;
pub mod observability;
mod registry;
pub mod scanout;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{BufferObject, Rect};
    pub use crate::config::DeviceConfig;
    pub use crate::device::Device;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::format::{BufferUsage, PixelFormat};
    pub use crate::handle::{BufferHandle, BufferHeader};
    pub use crate::kms::{EmulatedKernel, KernelConfig, KmsBackend};
    pub use crate::scanout::ScanoutState;
}

pub use buffer::{BufferObject, Rect};
pub use device::Device;
pub use error::{Error, ErrorKind, Result};
pub use handle::BufferHandle;
