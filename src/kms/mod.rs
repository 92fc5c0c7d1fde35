//! The kernel allocation/display boundary.
//!
//! A [`KmsBackend`] is one open connection to the kernel's memory manager and
//! mode-setting subsystem. Every call is a synchronous request/response; the
//! allocator above never retries or times out kernel calls itself.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                       Device                           │
//! │  auth / master state │ KMS state │ handle registry     │
//! └───────────────┬────────────────────────────────────────┘
//!                 │ KmsBackend (one connection)
//! ┌───────────────▼────────────────────────────────────────┐
//! │  memory objects │ names │ mappings │ framebuffers │ CRTC│
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! [`EmulatedKernel`] implements the boundary in-process on top of memfd so
//! the allocator can run (and be tested) without a display device.

mod emulated;

pub use emulated::{EmulatedConnection, EmulatedKernel, KernelConfig};

use crate::error::Result;
use crate::format::PixelFormat;
use crate::memory::CpuMapping;

/// Per-connection reference to a kernel memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GemHandle(pub u32);

/// Identifier of a framebuffer registered with the display subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub u32);

/// Authentication token issued to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuthMagic(pub u32);

/// Geometry of a framebuffer to register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferSpec {
    /// Visible width in pixels.
    pub width: u32,
    /// Visible height in pixels.
    pub height: u32,
    /// Row pitch in bytes.
    pub pitch: u32,
    /// DRM fourcc of the pixel data.
    pub fourcc: u32,
}

/// Display description returned once mode-setting is initialized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KmsInfo {
    /// Active mode width in pixels.
    pub width: u32,
    /// Active mode height in pixels.
    pub height: u32,
    /// Refresh rate in Hz.
    pub refresh_hz: u32,
    /// Whether a flip may be queued while the previous frame is still scanned out.
    pub pipelined: bool,
    /// Whether the CPU may map a buffer that is attached to scanout.
    pub cpu_access_during_scanout: bool,
    /// Required framebuffer pitch alignment in bytes.
    pub pitch_alignment: u32,
    /// Horizontal dots per inch.
    pub xdpi: f32,
    /// Vertical dots per inch.
    pub ydpi: f32,
    /// Format the display prefers for framebuffers.
    pub preferred_format: PixelFormat,
}

impl KmsInfo {
    /// Duration of one refresh cycle.
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(1_000_000_000 / u64::from(self.refresh_hz.max(1)))
    }
}

/// One connection to the kernel allocation and mode-setting subsystem.
pub trait KmsBackend: Send + Sync {
    /// Numeric identity of the connection (for diagnostics).
    fn fd(&self) -> i32;

    /// Whether this connection currently holds display mastership.
    fn is_master(&self) -> bool;

    /// Get this connection's authentication token.
    fn get_magic(&self) -> Result<AuthMagic>;

    /// Authenticate the connection that was issued `magic`.
    ///
    /// Only the display master may authenticate other connections.
    fn auth_magic(&self, magic: AuthMagic) -> Result<()>;

    /// Claim display mastership.
    fn set_master(&self) -> Result<()>;

    /// Release display mastership.
    fn drop_master(&self) -> Result<()>;

    /// Allocate a new memory object of `size` bytes.
    fn create_object(&self, size: usize) -> Result<GemHandle>;

    /// Export an object as a global name other connections can open.
    fn flink(&self, handle: GemHandle) -> Result<u32>;

    /// Open an object by global name. Returns the handle and object size.
    fn open_object(&self, name: u32) -> Result<(GemHandle, usize)>;

    /// Drop this connection's reference to an object.
    fn close_object(&self, handle: GemHandle) -> Result<()>;

    /// Map an object for CPU access.
    fn map_object(&self, handle: GemHandle, writable: bool) -> Result<CpuMapping>;

    /// Query display resources.
    fn init_kms(&self) -> Result<KmsInfo>;

    /// Release display resources.
    fn fini_kms(&self) -> Result<()>;

    /// Register an object as a scanout framebuffer.
    fn add_framebuffer(&self, handle: GemHandle, spec: FramebufferSpec) -> Result<FramebufferId>;

    /// Unregister a framebuffer.
    fn remove_framebuffer(&self, fb: FramebufferId) -> Result<()>;

    /// Program the CRTC to scan out `fb` (full modeset, synchronous).
    fn set_crtc(&self, fb: FramebufferId) -> Result<()>;

    /// Queue a flip to `fb` on the next vertical blank.
    fn page_flip(&self, fb: FramebufferId) -> Result<()>;

    /// Block until this connection's queued flip has completed.
    ///
    /// Returns immediately when no flip is pending.
    fn wait_flip(&self) -> Result<()>;
}

impl<B: KmsBackend + ?Sized> KmsBackend for Box<B> {
    fn fd(&self) -> i32 {
        (**self).fd()
    }
    fn is_master(&self) -> bool {
        (**self).is_master()
    }
    fn get_magic(&self) -> Result<AuthMagic> {
        (**self).get_magic()
    }
    fn auth_magic(&self, magic: AuthMagic) -> Result<()> {
        (**self).auth_magic(magic)
    }
    fn set_master(&self) -> Result<()> {
        (**self).set_master()
    }
    fn drop_master(&self) -> Result<()> {
        (**self).drop_master()
    }
    fn create_object(&self, size: usize) -> Result<GemHandle> {
        (**self).create_object(size)
    }
    fn flink(&self, handle: GemHandle) -> Result<u32> {
        (**self).flink(handle)
    }
    fn open_object(&self, name: u32) -> Result<(GemHandle, usize)> {
        (**self).open_object(name)
    }
    fn close_object(&self, handle: GemHandle) -> Result<()> {
        (**self).close_object(handle)
    }
    fn map_object(&self, handle: GemHandle, writable: bool) -> Result<CpuMapping> {
        (**self).map_object(handle, writable)
    }
    fn init_kms(&self) -> Result<KmsInfo> {
        (**self).init_kms()
    }
    fn fini_kms(&self) -> Result<()> {
        (**self).fini_kms()
    }
    fn add_framebuffer(&self, handle: GemHandle, spec: FramebufferSpec) -> Result<FramebufferId> {
        (**self).add_framebuffer(handle, spec)
    }
    fn remove_framebuffer(&self, fb: FramebufferId) -> Result<()> {
        (**self).remove_framebuffer(fb)
    }
    fn set_crtc(&self, fb: FramebufferId) -> Result<()> {
        (**self).set_crtc(fb)
    }
    fn page_flip(&self, fb: FramebufferId) -> Result<()> {
        (**self).page_flip(fb)
    }
    fn wait_flip(&self) -> Result<()> {
        (**self).wait_flip()
    }
}
