//! Pixel formats, usage flags and geometry rules.
//!
//! Every format-dependent number in the crate comes from [`PixelFormat::layout`],
//! a single match over the closed set of supported formats. Adding a format
//! means adding a variant and its layout; call sites never branch on formats.
//!
//! # Example
//!
//! ```rust
//! use kmsalloc::format::{PixelFormat, align_geometry};
//!
//! // YV12: width rounds to 32, height to 2, then half again for chroma rows.
//! assert_eq!(align_geometry(PixelFormat::Yv12, 100, 100), Some((128, 150)));
//! assert_eq!(PixelFormat::Rgba8888.bytes_per_pixel(), 4);
//! ```

use crate::error::{Error, Result};
use bitflags::bitflags;

/// Build a DRM fourcc code from four ASCII characters.
const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// DRM `ABGR8888`: R, G, B, A bytes in memory.
pub const DRM_FORMAT_ABGR8888: u32 = fourcc(b'A', b'B', b'2', b'4');
/// DRM `XBGR8888`: R, G, B, X bytes in memory.
pub const DRM_FORMAT_XBGR8888: u32 = fourcc(b'X', b'B', b'2', b'4');
/// DRM `ARGB8888`: B, G, R, A bytes in memory.
pub const DRM_FORMAT_ARGB8888: u32 = fourcc(b'A', b'R', b'2', b'4');
/// DRM `RGB565`.
pub const DRM_FORMAT_RGB565: u32 = fourcc(b'R', b'G', b'1', b'6');

/// Pixel formats (HAL numbering).
///
/// The discriminants are the integer values carried in handle headers, so
/// they must never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum PixelFormat {
    // ========================================================================
    // Packed RGB formats
    // ========================================================================
    /// RGBA 8-bit per channel (32 bits/pixel).
    Rgba8888 = 1,
    /// RGBX 8-bit per channel, alpha ignored (32 bits/pixel).
    Rgbx8888 = 2,
    /// RGB 8-bit per channel (24 bits/pixel).
    Rgb888 = 3,
    /// RGB 5-6-5 (16 bits/pixel).
    Rgb565 = 4,
    /// BGRA 8-bit per channel (32 bits/pixel).
    Bgra8888 = 5,
    /// RGBA 5-5-5-1 (16 bits/pixel).
    Rgba5551 = 6,
    /// RGBA 4-4-4-4 (16 bits/pixel).
    Rgba4444 = 7,

    // ========================================================================
    // YUV formats
    // ========================================================================
    /// YUV 4:2:2 semi-planar (NV16).
    YCbCr422Sp = 0x10,
    /// YUV 4:2:0 semi-planar, V first (NV21).
    YCrCb420Sp = 0x11,
    /// YUV 4:2:2 packed (YUYV).
    YCbCr422I = 0x14,
    /// YUV 4:2:0 planar, Y then V then U.
    Yv12 = 0x3231_5659,
}

/// Per-format layout parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatLayout {
    /// Bytes per pixel of the first (luma or packed) plane.
    pub bpp: u32,
    /// Horizontal alignment in pixels (power of two).
    pub align_width: u32,
    /// Vertical alignment in rows (power of two).
    pub align_height: u32,
    /// When non-zero, `height / extra_height_div` rows are appended for chroma.
    pub extra_height_div: u32,
    /// DRM fourcc when the display pipeline can scan this format out.
    pub scanout_fourcc: Option<u32>,
}

impl FormatLayout {
    const fn packed(bpp: u32, scanout_fourcc: Option<u32>) -> Self {
        Self {
            bpp,
            align_width: 1,
            align_height: 1,
            extra_height_div: 0,
            scanout_fourcc,
        }
    }
}

impl PixelFormat {
    /// Every supported format, in discriminant order.
    pub const ALL: [PixelFormat; 11] = [
        PixelFormat::Rgba8888,
        PixelFormat::Rgbx8888,
        PixelFormat::Rgb888,
        PixelFormat::Rgb565,
        PixelFormat::Bgra8888,
        PixelFormat::Rgba5551,
        PixelFormat::Rgba4444,
        PixelFormat::YCbCr422Sp,
        PixelFormat::YCrCb420Sp,
        PixelFormat::YCbCr422I,
        PixelFormat::Yv12,
    ];

    /// Layout table entry for this format.
    pub const fn layout(self) -> FormatLayout {
        match self {
            PixelFormat::Rgba8888 => FormatLayout::packed(4, Some(DRM_FORMAT_ABGR8888)),
            PixelFormat::Rgbx8888 => FormatLayout::packed(4, Some(DRM_FORMAT_XBGR8888)),
            PixelFormat::Bgra8888 => FormatLayout::packed(4, Some(DRM_FORMAT_ARGB8888)),
            PixelFormat::Rgb888 => FormatLayout::packed(3, None),
            PixelFormat::Rgb565 => FormatLayout::packed(2, Some(DRM_FORMAT_RGB565)),
            PixelFormat::Rgba5551 | PixelFormat::Rgba4444 => FormatLayout::packed(2, None),
            PixelFormat::YCbCr422I => FormatLayout {
                align_width: 2,
                ..FormatLayout::packed(2, None)
            },
            // planar; only Y is counted in bpp
            PixelFormat::Yv12 => FormatLayout {
                bpp: 1,
                align_width: 32,
                align_height: 2,
                extra_height_div: 2,
                scanout_fourcc: None,
            },
            PixelFormat::YCbCr422Sp => FormatLayout {
                bpp: 1,
                align_width: 2,
                align_height: 1,
                extra_height_div: 1,
                scanout_fourcc: None,
            },
            PixelFormat::YCrCb420Sp => FormatLayout {
                bpp: 1,
                align_width: 2,
                align_height: 2,
                extra_height_div: 2,
                scanout_fourcc: None,
            },
        }
    }

    /// Bytes per pixel (luma plane only for planar formats).
    #[inline]
    pub const fn bytes_per_pixel(self) -> u32 {
        self.layout().bpp
    }

    /// Can the display pipeline present this format?
    #[inline]
    pub const fn is_presentable(self) -> bool {
        self.layout().scanout_fourcc.is_some()
    }

    /// DRM fourcc used when attaching a framebuffer.
    #[inline]
    pub const fn drm_fourcc(self) -> Option<u32> {
        self.layout().scanout_fourcc
    }

    /// Whether the format stores chroma in extra rows after the luma plane.
    #[inline]
    pub const fn is_planar(self) -> bool {
        self.layout().extra_height_div != 0
    }

    /// The HAL integer value.
    #[inline]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for PixelFormat {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        PixelFormat::ALL
            .into_iter()
            .find(|f| f.as_raw() == value)
            .ok_or(Error::UnsupportedFormat(value))
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::Rgba8888 => "RGBA_8888",
            PixelFormat::Rgbx8888 => "RGBX_8888",
            PixelFormat::Rgb888 => "RGB_888",
            PixelFormat::Rgb565 => "RGB_565",
            PixelFormat::Bgra8888 => "BGRA_8888",
            PixelFormat::Rgba5551 => "RGBA_5551",
            PixelFormat::Rgba4444 => "RGBA_4444",
            PixelFormat::YCbCr422Sp => "YCbCr_422_SP",
            PixelFormat::YCrCb420Sp => "YCrCb_420_SP",
            PixelFormat::YCbCr422I => "YCbCr_422_I",
            PixelFormat::Yv12 => "YV12",
        };
        f.write_str(name)
    }
}

/// Bytes per pixel for a raw HAL format value.
///
/// Returns 0 for values outside the table. For planar formats only the luma
/// plane is counted; use [`align_geometry`] for the full allocation height.
pub fn bytes_per_pixel(format: i32) -> u32 {
    PixelFormat::try_from(format)
        .map(PixelFormat::bytes_per_pixel)
        .unwrap_or(0)
}

#[inline]
const fn align_up(value: u32, align: u32) -> Option<u32> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round width and height up to the format's alignment.
///
/// Returns `None` if either rounded value does not fit in a `u32`.
/// This step alone is idempotent for every format.
pub const fn align_dimensions(format: PixelFormat, width: u32, height: u32) -> Option<(u32, u32)> {
    let layout = format.layout();
    match (
        align_up(width, layout.align_width),
        align_up(height, layout.align_height),
    ) {
        (Some(width), Some(height)) => Some((width, height)),
        _ => None,
    }
}

/// Compute the allocation geometry for a buffer.
///
/// Rounds the dimensions with [`align_dimensions`], then, for formats with
/// chroma stored after the luma plane, adds `height / extra_height_div` rows.
/// For packed formats this is a no-op on already aligned input.
///
/// Returns `None` on `u32` overflow.
pub const fn align_geometry(format: PixelFormat, width: u32, height: u32) -> Option<(u32, u32)> {
    let Some((width, height)) = align_dimensions(format, width, height) else {
        return None;
    };
    let div = format.layout().extra_height_div;
    if div == 0 {
        return Some((width, height));
    }
    match height.checked_add(height / div) {
        Some(height) => Some((width, height)),
        None => None,
    }
}

bitflags! {
    /// Intended consumers of a buffer (HAL usage bits).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// CPU reads, infrequent.
        const SW_READ_RARELY = 0x0000_0002;
        /// CPU reads, frequent.
        const SW_READ_OFTEN = 0x0000_0003;
        /// CPU writes, infrequent.
        const SW_WRITE_RARELY = 0x0000_0020;
        /// CPU writes, frequent.
        const SW_WRITE_OFTEN = 0x0000_0030;
        /// Sampled by the GPU.
        const HW_TEXTURE = 0x0000_0100;
        /// Rendered to by the GPU.
        const HW_RENDER = 0x0000_0200;
        /// Used by a 2D blitter.
        const HW_2D = 0x0000_0400;
        /// Used by a hardware composer overlay.
        const HW_COMPOSER = 0x0000_0800;
        /// Scanned out by the display pipeline.
        const HW_FB = 0x0000_1000;
        /// Consumed by a video encoder.
        const HW_VIDEO_ENCODER = 0x0001_0000;
    }
}

impl BufferUsage {
    /// All CPU-read bits.
    pub const SW_READ_MASK: BufferUsage = BufferUsage::SW_READ_OFTEN;
    /// All CPU-write bits.
    pub const SW_WRITE_MASK: BufferUsage = BufferUsage::SW_WRITE_OFTEN;

    /// Does the usage include any CPU read intent?
    #[inline]
    pub fn reads_cpu(self) -> bool {
        self.intersects(Self::SW_READ_MASK)
    }

    /// Does the usage include any CPU write intent?
    #[inline]
    pub fn writes_cpu(self) -> bool {
        self.intersects(Self::SW_WRITE_MASK)
    }

    /// Does the usage include display scanout intent?
    #[inline]
    pub fn is_scanout(self) -> bool {
        self.contains(Self::HW_FB)
    }

    /// Parse a raw header value, rejecting bits outside the known set.
    pub fn from_raw(raw: i32) -> Result<Self> {
        BufferUsage::from_bits(raw as u32)
            .ok_or_else(|| Error::UnsupportedUsage(format!("unknown usage bits {:#x}", raw)))
    }
}
