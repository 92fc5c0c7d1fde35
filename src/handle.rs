//! Cross-process buffer handles.
//!
//! A [`BufferHandle`] is what one process sends another so the receiver can
//! wrap the same kernel memory object: the object's global name plus a
//! [`BufferHeader`] that redundantly records the buffer's metadata.
//!
//! # Wire Format
//!
//! ```text
//! offset  size  field
//!      0     4  magic "KMSB" (u32 LE)
//!      4     2  version (u16 LE)
//!      6     2  header length (u16 LE) = 20
//!      8     4  name (u32 LE)
//!     12     4  width (i32 LE)
//!     16     4  height (i32 LE)
//!     20     4  format (i32 LE)
//!     24     4  stride (i32 LE)
//!     28     4  usage (i32 LE)
//! ```
//!
//! Decoding checks the framing; [`BufferHeader::validate`] checks that the
//! metadata is self-consistent before anything is imported.

use crate::config::{HANDLE_MAGIC, HANDLE_VERSION};
use crate::error::{Error, Result};
use crate::format::{BufferUsage, PixelFormat, align_geometry};

/// Encoded size of a [`BufferHeader`].
pub const HEADER_LEN: usize = 20;

/// Metadata carried with every handle, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHeader {
    /// Requested width in pixels.
    pub width: i32,
    /// Requested height in pixels.
    pub height: i32,
    /// HAL pixel format.
    pub format: i32,
    /// Row pitch in bytes.
    pub stride: i32,
    /// HAL usage bits.
    pub usage: i32,
}

impl BufferHeader {
    /// Check that the header describes a buffer this crate could have made.
    ///
    /// Returns the parsed format and usage.
    pub fn validate(&self) -> Result<(PixelFormat, BufferUsage)> {
        if self.width <= 0 || self.height <= 0 {
            return Err(Error::CorruptHandle(format!(
                "non-positive dimensions {}x{}",
                self.width, self.height
            )));
        }
        let format = PixelFormat::try_from(self.format)
            .map_err(|_| Error::CorruptHandle(format!("unknown format {:#x}", self.format)))?;
        let usage = BufferUsage::from_raw(self.usage)
            .map_err(|_| Error::CorruptHandle(format!("unknown usage bits {:#x}", self.usage)))?;

        let min_stride = i64::from(self.width) * i64::from(format.bytes_per_pixel());
        if i64::from(self.stride) < min_stride {
            return Err(Error::CorruptHandle(format!(
                "stride {} smaller than width {} x {} bpp",
                self.stride,
                self.width,
                format.bytes_per_pixel()
            )));
        }
        Ok((format, usage))
    }

    /// Bytes the backing object must hold for this header.
    ///
    /// Only meaningful for a header that passed [`validate`](Self::validate).
    pub fn required_size(&self, format: PixelFormat) -> Result<usize> {
        align_geometry(format, self.width as u32, self.height as u32)
            .and_then(|(_, rows)| (self.stride as usize).checked_mul(rows as usize))
            .ok_or_else(|| {
                Error::CorruptHandle(format!(
                    "{}x{} with stride {} overflows",
                    self.width, self.height, self.stride
                ))
            })
    }

    fn write_to(&self, out: &mut [u8]) {
        for (chunk, value) in out.chunks_exact_mut(4).zip([
            self.width,
            self.height,
            self.format,
            self.stride,
            self.usage,
        ]) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
    }

    fn read_from(bytes: &[u8]) -> Self {
        let field = |i: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            i32::from_le_bytes(raw)
        };
        Self {
            width: field(0),
            height: field(1),
            format: field(2),
            stride: field(3),
            usage: field(4),
        }
    }
}

/// A transferable reference to a buffer: kernel object name plus metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    name: u32,
    header: BufferHeader,
}

impl BufferHandle {
    /// Encoded size in bytes.
    pub const ENCODED_LEN: usize = 12 + HEADER_LEN;

    /// Build a handle.
    pub fn new(name: u32, header: BufferHeader) -> Self {
        Self { name, header }
    }

    /// Global name of the kernel memory object.
    #[inline]
    pub fn name(&self) -> u32 {
        self.name
    }

    /// Metadata header.
    #[inline]
    pub fn header(&self) -> &BufferHeader {
        &self.header
    }

    /// Row pitch in bytes.
    #[inline]
    pub fn stride(&self) -> i32 {
        self.header.stride
    }

    /// Serialize into the fixed wire layout.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&HANDLE_MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&HANDLE_VERSION.to_le_bytes());
        out[6..8].copy_from_slice(&(HEADER_LEN as u16).to_le_bytes());
        out[8..12].copy_from_slice(&self.name.to_le_bytes());
        self.header.write_to(&mut out[12..]);
        out
    }

    /// Parse the wire layout.
    ///
    /// Only the framing is checked here; call
    /// [`BufferHeader::validate`] before trusting the metadata.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(Error::CorruptHandle(format!(
                "expected {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != HANDLE_MAGIC {
            return Err(Error::CorruptHandle(format!(
                "invalid handle magic: expected {:x}, got {:x}",
                HANDLE_MAGIC, magic
            )));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != HANDLE_VERSION {
            return Err(Error::CorruptHandle(format!(
                "unsupported handle version: expected {}, got {}",
                HANDLE_VERSION, version
            )));
        }
        let header_len = u16::from_le_bytes([bytes[6], bytes[7]]);
        if header_len as usize != HEADER_LEN {
            return Err(Error::CorruptHandle(format!(
                "header length {} (expected {})",
                header_len, HEADER_LEN
            )));
        }

        let name = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        Ok(Self {
            name,
            header: BufferHeader::read_from(&bytes[12..]),
        })
    }
}
