//! Buffer objects: one allocated or imported pixel buffer.
//!
//! A [`BufferObject`] wraps one kernel memory object together with the
//! metadata needed to interpret it. Buffers are always owned by a
//! [`Device`](crate::Device)'s registry; callers hold `Arc<BufferObject>`
//! clones that stay valid (but inert) after the buffer is destroyed.
//!
//! # CPU Access
//!
//! ```rust
//! use kmsalloc::{Device, Rect};
//! use kmsalloc::format::{BufferUsage, PixelFormat};
//! use kmsalloc::kms::{EmulatedKernel, KernelConfig};
//!
//! let kernel = EmulatedKernel::new(KernelConfig::default());
//! let device = Device::open(kernel.connect().unwrap()).unwrap();
//! let bo = device
//!     .create_buffer(64, 64, PixelFormat::Rgba8888, BufferUsage::SW_WRITE_OFTEN)
//!     .unwrap();
//!
//! let ptr = bo.lock(Rect::new(0, 0, 64, 64), true).unwrap();
//! unsafe { ptr.as_ptr().write_bytes(0xff, 4) };
//! bo.unlock().unwrap();
//! bo.destroy().unwrap();
//! ```

use crate::device::DeviceShared;
use crate::error::{Error, Result};
use crate::format::{BufferUsage, PixelFormat, align_geometry};
use crate::handle::{BufferHandle, BufferHeader};
use crate::kms::{FramebufferId, GemHandle};
use crate::memory::CpuMapping;
use crate::observability::{instrument_buffer, trace_buffer_created, trace_buffer_imported};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Create a rectangle.
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether the rectangle covers no pixels.
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the rectangle lies inside a `width` x `height` area.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        let right = u64::from(self.x) + u64::from(self.width);
        let bottom = u64::from(self.y) + u64::from(self.height);
        right <= u64::from(width) && bottom <= u64::from(height)
    }
}

/// An outstanding CPU lock.
#[derive(Debug, Clone, Copy)]
struct LockState {
    writable: bool,
    rect: Rect,
}

/// Mutable per-buffer state.
#[derive(Debug, Default)]
pub(crate) struct BufferState {
    mapping: Option<CpuMapping>,
    lock: Option<LockState>,
    pub(crate) framebuffer: Option<FramebufferId>,
    destroyed: bool,
}

impl BufferState {
    pub(crate) fn ensure_alive(&self) -> Result<()> {
        if self.destroyed {
            Err(Error::Destroyed)
        } else {
            Ok(())
        }
    }
}

/// One pixel buffer backed by a kernel memory object.
pub struct BufferObject {
    /// Owning device. Weak so the registry does not keep itself alive.
    device: Weak<DeviceShared>,
    gem: GemHandle,
    name: u32,
    header: BufferHeader,
    format: PixelFormat,
    usage: BufferUsage,
    size: usize,
    imported: bool,
    refcount: AtomicU32,
    pub(crate) state: Mutex<BufferState>,
}

impl BufferObject {
    /// Allocate new kernel memory for a `width` x `height` buffer.
    pub(crate) fn allocate(
        shared: &Arc<DeviceShared>,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<Self> {
        let config = &shared.config;
        if width == 0 || height == 0 {
            return Err(Error::InvalidGeometry(format!(
                "{}x{} has no area",
                width, height
            )));
        }
        if width > config.max_dimension || height > config.max_dimension {
            return Err(Error::InvalidGeometry(format!(
                "{}x{} exceeds the {} pixel limit",
                width, height, config.max_dimension
            )));
        }
        if usage.is_scanout() && !format.is_presentable() {
            return Err(Error::UnsupportedUsage(format!(
                "{} cannot be scanned out",
                format
            )));
        }

        let (aligned_width, aligned_height) = align_geometry(format, width, height)
            .ok_or_else(|| {
                Error::InvalidGeometry(format!("{}x{} overflows when aligned", width, height))
            })?;
        let row = u64::from(aligned_width) * u64::from(format.bytes_per_pixel());
        let alignment = u64::from(config.stride_alignment);
        let stride = row.div_ceil(alignment) * alignment;
        let stride = i32::try_from(stride)
            .map_err(|_| Error::InvalidGeometry(format!("stride {} overflows", stride)))?;
        let size = stride as usize * aligned_height as usize;

        let gem = shared.backend.create_object(size)?;
        let name = match shared.backend.flink(gem) {
            Ok(name) => name,
            Err(e) => {
                if let Err(close) = shared.backend.close_object(gem) {
                    tracing::warn!(error = %close, "failed to release unexported object");
                }
                return Err(e);
            }
        };

        trace_buffer_created(name, width as i32, height as i32, &format.to_string(), size);

        Ok(Self {
            device: Arc::downgrade(shared),
            gem,
            name,
            header: BufferHeader {
                width: width as i32,
                height: height as i32,
                format: format.as_raw(),
                stride,
                usage: usage.bits() as i32,
            },
            format,
            usage,
            size,
            imported: false,
            refcount: AtomicU32::new(1),
            state: Mutex::new(BufferState::default()),
        })
    }

    /// Wrap the kernel object named by a validated handle.
    pub(crate) fn import(
        shared: &Arc<DeviceShared>,
        handle: &BufferHandle,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<Self> {
        let required = handle.header().required_size(format)?;
        let (gem, size) = shared.backend.open_object(handle.name())?;

        if size < required {
            if let Err(close) = shared.backend.close_object(gem) {
                tracing::warn!(error = %close, "failed to release rejected import");
            }
            return Err(Error::CorruptHandle(format!(
                "object {} holds {} bytes, header needs {}",
                handle.name(),
                size,
                required
            )));
        }

        trace_buffer_imported(handle.name(), size);

        Ok(Self {
            device: Arc::downgrade(shared),
            gem,
            name: handle.name(),
            header: *handle.header(),
            format,
            usage,
            size,
            imported: true,
            refcount: AtomicU32::new(1),
            state: Mutex::new(BufferState::default()),
        })
    }

    pub(crate) fn device(&self) -> Result<Arc<DeviceShared>> {
        self.device.upgrade().ok_or(Error::Destroyed)
    }

    pub(crate) fn gem(&self) -> GemHandle {
        self.gem
    }

    pub(crate) fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference unless it is the last one. Returns true if it is.
    ///
    /// Only called under the registry write lock.
    pub(crate) fn release_unless_last(&self) -> bool {
        if self.refcount.load(Ordering::Acquire) <= 1 {
            return true;
        }
        self.refcount.fetch_sub(1, Ordering::AcqRel);
        false
    }

    /// Release the kernel object. Refuses while a CPU lock is held or a
    /// framebuffer that cannot be auto-detached is attached.
    pub(crate) fn teardown(&self, shared: &DeviceShared) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ensure_alive()?;
        if state.lock.is_some() {
            tracing::error!(name = self.name, "destroy while locked for CPU access");
            return Err(Error::BufferBusy("buffer is locked for CPU access".into()));
        }
        if let Some(fb) = state.framebuffer {
            if !self.needs_framebuffer() {
                tracing::error!(name = self.name, "destroy with framebuffer attached");
                return Err(Error::BufferBusy("framebuffer still attached".into()));
            }
            shared.remove_framebuffer(fb)?;
            state.framebuffer = None;
        }

        state.mapping = None;
        shared.backend.close_object(self.gem)?;
        state.destroyed = true;
        self.refcount.store(0, Ordering::Release);
        Ok(())
    }

    /// Release one reference; the buffer is torn down when none remain.
    ///
    /// # Errors
    ///
    /// - [`Error::BufferBusy`] if the last reference goes while the buffer
    ///   is locked, or has a framebuffer attached and no scanout usage.
    /// - [`Error::Destroyed`] if the device or the buffer is already gone,
    ///   including when this wrapper was torn down and its object has since
    ///   been imported again under a new wrapper.
    pub fn destroy(&self) -> Result<()> {
        self.state.lock().unwrap().ensure_alive()?;
        let device = self.device()?;
        let _span = instrument_buffer(device.config.tracing.buffer_spans, self.name, "destroy");
        device.release(self.name, Some(self))
    }

    /// The handle to send to another process.
    pub fn handle(&self) -> BufferHandle {
        BufferHandle::new(self.name, self.header)
    }

    /// The handle together with the row pitch in bytes.
    pub fn export(&self) -> (BufferHandle, u32) {
        (self.handle(), self.stride())
    }

    /// Map the buffer for CPU access and return the address of `rect`'s origin.
    ///
    /// Locks do not nest: a second `lock` before [`unlock`](Self::unlock)
    /// fails with [`Error::AlreadyLocked`] and leaves the first lock intact.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfBounds`] if `rect` is empty or leaves the buffer.
    /// - [`Error::ScanoutBusy`] if the buffer is attached and the display
    ///   forbids CPU access during scanout.
    /// - [`Error::UnsupportedUsage`] if the buffer was not allocated for the
    ///   requested kind of CPU access.
    /// - [`Error::MapFailed`] if the kernel refuses the mapping.
    pub fn lock(&self, rect: Rect, enable_write: bool) -> Result<NonNull<u8>> {
        let device = self.device()?;
        let _span = instrument_buffer(device.config.tracing.buffer_spans, self.name, "lock");

        let mut state = self.state.lock().unwrap();
        state.ensure_alive()?;
        if state.lock.is_some() {
            tracing::error!(name = self.name, "nested lock");
            return Err(Error::AlreadyLocked);
        }
        if rect.is_empty() || !rect.fits_within(self.width(), self.height()) {
            return Err(Error::OutOfBounds(format!(
                "{:?} in {}x{}",
                rect,
                self.width(),
                self.height()
            )));
        }
        if state.framebuffer.is_some() && !device.cpu_access_during_scanout() {
            return Err(Error::ScanoutBusy);
        }

        let scanout = self.usage.is_scanout();
        if !(self.usage.reads_cpu() || self.usage.writes_cpu() || scanout) {
            return Err(Error::UnsupportedUsage(
                "buffer was not allocated for CPU access".into(),
            ));
        }
        if enable_write && !(self.usage.writes_cpu() || scanout) {
            return Err(Error::UnsupportedUsage(
                "buffer was not allocated for CPU writes".into(),
            ));
        }

        let mapping = device.backend.map_object(self.gem, enable_write)?;
        let offset = rect.y as usize * self.stride() as usize
            + rect.x as usize * self.format.bytes_per_pixel() as usize;
        let ptr = mapping
            .ptr_at(offset)
            .ok_or_else(|| Error::OutOfBounds(format!("offset {} past mapping", offset)))?;

        tracing::trace!(name = self.name, ?rect, write = enable_write, "locked");
        state.mapping = Some(mapping);
        state.lock = Some(LockState {
            writable: enable_write,
            rect,
        });
        Ok(ptr)
    }

    /// End CPU access. Write locks are flushed before returning.
    ///
    /// # Errors
    ///
    /// [`Error::NotLocked`] when no lock is outstanding.
    pub fn unlock(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ensure_alive()?;
        let Some(lock) = state.lock.take() else {
            tracing::error!(name = self.name, "unlock without lock");
            return Err(Error::NotLocked);
        };

        if let Some(mapping) = state.mapping.take() {
            if lock.writable {
                mapping.flush()?;
            }
        }
        tracing::trace!(name = self.name, rect = ?lock.rect, "unlocked");
        Ok(())
    }

    /// Global name of the kernel object.
    #[inline]
    pub fn name(&self) -> u32 {
        self.name
    }

    /// Requested width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.header.width as u32
    }

    /// Requested height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.header.height as u32
    }

    /// Row pitch in bytes.
    #[inline]
    pub fn stride(&self) -> u32 {
        self.header.stride as u32
    }

    /// Pixel format.
    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Usage flags.
    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Size of the kernel object in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Metadata header as sent in handles.
    #[inline]
    pub fn header(&self) -> &BufferHeader {
        &self.header
    }

    /// Whether this wrapper came from a received handle.
    #[inline]
    pub fn is_imported(&self) -> bool {
        self.imported
    }

    /// Current reference count (0 once destroyed).
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Attached framebuffer, if any.
    pub fn framebuffer(&self) -> Option<FramebufferId> {
        self.state.lock().unwrap().framebuffer
    }

    /// Whether a CPU lock is outstanding.
    pub fn is_locked(&self) -> bool {
        self.state.lock().unwrap().lock.is_some()
    }

    /// Whether the kernel object has been released.
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().unwrap().destroyed
    }
}

impl std::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferObject")
            .field("name", &self.name)
            .field("width", &self.header.width)
            .field("height", &self.header.height)
            .field("format", &self.format)
            .field("stride", &self.header.stride)
            .field("usage", &self.usage)
            .field("imported", &self.imported)
            .field("refcount", &self.refcount())
            .finish()
    }
}
