//! CPU mappings of kernel memory objects.
//!
//! A [`CpuMapping`] is a `MAP_SHARED` view of a kernel memory object. Because
//! the mapping is shared, writes through it are visible to every other
//! mapping of the same object, in this process or another one.
//!
//! # Example
//!
//! ```rust,ignore
//! use kmsalloc::memory::CpuMapping;
//!
//! let mapping = CpuMapping::map(object_fd.as_fd(), size, true)?;
//! unsafe { *mapping.as_mut_ptr().unwrap() = 0xff };
//! mapping.flush()?;
//! ```

use crate::error::{Error, Result};
use rustix::fd::BorrowedFd;
use rustix::mm::{MapFlags, MsyncFlags, ProtFlags};
use std::ptr::NonNull;

/// A memory-mapped view of a kernel memory object.
///
/// The mapping is unmapped on drop. It does not keep the object's file
/// descriptor open; the kernel keeps the pages alive for as long as the
/// mapping exists.
///
/// # Thread Safety
///
/// `CpuMapping` is `Send + Sync`. Concurrent writers must be serialized by
/// the caller, as with any shared memory.
pub struct CpuMapping {
    /// Start of the mapped region.
    ptr: NonNull<u8>,
    /// Size in bytes.
    len: usize,
    /// Whether the region was mapped writable.
    writable: bool,
}

impl CpuMapping {
    /// Map `len` bytes of `fd` starting at offset 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MapFailed`] if `len` is 0 or `mmap` fails.
    pub fn map(fd: BorrowedFd<'_>, len: usize, writable: bool) -> Result<Self> {
        if len == 0 {
            return Err(Error::MapFailed("cannot map an empty object".into()));
        }

        let prot = if writable {
            ProtFlags::READ | ProtFlags::WRITE
        } else {
            ProtFlags::READ
        };

        // SAFETY: a null hint lets the kernel choose the address; the
        // resulting region is owned by this value until drop.
        let ptr = unsafe {
            rustix::mm::mmap(std::ptr::null_mut(), len, prot, MapFlags::SHARED, fd, 0)
                .map_err(|e| Error::MapFailed(format!("mmap failed: {}", e)))?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::MapFailed("mmap returned null".into()))?;

        Ok(Self { ptr, len, writable })
    }

    /// Start of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Writable start of the mapping, `None` for read-only mappings.
    #[inline]
    pub fn as_mut_ptr(&self) -> Option<*mut u8> {
        self.writable.then(|| self.ptr.as_ptr())
    }

    /// Pointer to `offset` bytes into the mapping.
    ///
    /// Returns `None` when `offset` is past the end.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> Option<NonNull<u8>> {
        if offset >= self.len {
            return None;
        }
        // SAFETY: offset is in bounds of the mapped region.
        Some(unsafe { self.ptr.add(offset) })
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty (never, in practice).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the mapping accepts writes.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// View the mapping as bytes.
    ///
    /// # Safety
    ///
    /// No one may write to the object while the slice is alive.
    #[inline]
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes; caller excludes writers.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Make CPU writes visible to other consumers of the object.
    pub fn flush(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        // SAFETY: the range is exactly the region we mapped.
        unsafe { rustix::mm::msync(self.ptr.as_ptr().cast(), self.len, MsyncFlags::SYNC)? };
        Ok(())
    }
}

impl Drop for CpuMapping {
    fn drop(&mut self) {
        // SAFETY: we own this mapping and nothing references it past drop.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the mapping is plain shared memory with no thread-local state.
unsafe impl Send for CpuMapping {}

// SAFETY: reads through &self are safe; writes go through raw pointers whose
// synchronization is the caller's responsibility.
unsafe impl Sync for CpuMapping {}

impl std::fmt::Debug for CpuMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuMapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("writable", &self.writable)
            .finish()
    }
}
