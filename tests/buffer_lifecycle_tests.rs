//! Buffer lifecycle tests: allocation, CPU access, export/import within one
//! process, and teardown rules.

use kmsalloc::format::{BufferUsage, PixelFormat, align_geometry, bytes_per_pixel};
use kmsalloc::kms::{EmulatedKernel, KernelConfig};
use kmsalloc::{Device, Error, ErrorKind, Rect};
use std::sync::Arc;

fn open() -> (Arc<EmulatedKernel>, Device) {
    let kernel = EmulatedKernel::new(KernelConfig::default().with_refresh_hz(1000));
    let device = Device::open(kernel.connect().unwrap()).unwrap();
    (kernel, device)
}

const CPU: BufferUsage = BufferUsage::SW_READ_OFTEN.union(BufferUsage::SW_WRITE_OFTEN);

// ============================================================================
// Geometry
// ============================================================================

/// The documented alignment examples hold through the public API.
#[test]
fn test_geometry_examples() {
    assert_eq!(
        align_geometry(PixelFormat::Yv12, 100, 100),
        Some((128, 150))
    );
    assert_eq!(
        align_geometry(PixelFormat::YCbCr422Sp, 101, 50),
        Some((102, 100))
    );
    assert_eq!(align_geometry(PixelFormat::Yv12, u32::MAX - 3, 10), None);
    assert_eq!(bytes_per_pixel(PixelFormat::Rgba8888.as_raw()), 4);
    assert_eq!(bytes_per_pixel(PixelFormat::Rgb565.as_raw()), 2);
    assert_eq!(bytes_per_pixel(PixelFormat::Yv12.as_raw()), 1);
}

/// Every format can be allocated and the stride covers a full row.
#[test]
fn test_allocate_every_format() {
    let (kernel, device) = open();

    for format in PixelFormat::ALL {
        let bo = device.create_buffer(33, 17, format, CPU).unwrap();
        assert!(bo.stride() >= 33 * format.bytes_per_pixel(), "{format}");
        assert_eq!(bo.stride() % 64, 0, "{format}");
        assert_eq!(bo.format(), format);
        bo.destroy().unwrap();
    }
    assert_eq!(kernel.object_count(), 0);
}

// ============================================================================
// Lock / Unlock
// ============================================================================

/// lock -> unlock -> lock works with no mapping left behind.
#[test]
fn test_lock_unlock_lock() {
    let (_kernel, device) = open();
    let bo = device
        .create_buffer(64, 64, PixelFormat::Rgba8888, CPU)
        .unwrap();
    let rect = Rect::new(0, 0, 64, 64);

    bo.lock(rect, true).unwrap();
    assert!(bo.is_locked());
    bo.unlock().unwrap();
    assert!(!bo.is_locked());
    bo.lock(rect, false).unwrap();
    bo.unlock().unwrap();
    bo.destroy().unwrap();
}

/// A second lock is refused and leaves the first lock usable.
#[test]
fn test_nested_lock_rejected() {
    let (_kernel, device) = open();
    let bo = device
        .create_buffer(16, 16, PixelFormat::Rgba8888, CPU)
        .unwrap();
    let rect = Rect::new(0, 0, 16, 16);

    let ptr = bo.lock(rect, true).unwrap();
    let err = bo.lock(rect, true).unwrap_err();
    assert!(matches!(err, Error::AlreadyLocked));
    assert_eq!(err.kind(), ErrorKind::ContractViolation);

    unsafe { ptr.as_ptr().write(1) };
    bo.unlock().unwrap();
    assert!(matches!(bo.unlock(), Err(Error::NotLocked)));
    bo.destroy().unwrap();
}

/// Writes survive unlock and are visible to the next lock.
#[test]
fn test_writes_persist_across_locks() {
    let (_kernel, device) = open();
    let bo = device
        .create_buffer(8, 8, PixelFormat::Rgba8888, CPU)
        .unwrap();
    let stride = bo.stride() as usize;

    let ptr = bo.lock(Rect::new(0, 0, 8, 8), true).unwrap();
    unsafe {
        for row in 0..8 {
            ptr.as_ptr().add(row * stride).write(row as u8);
        }
    }
    bo.unlock().unwrap();

    let ptr = bo.lock(Rect::new(0, 4, 8, 4), false).unwrap();
    assert_eq!(unsafe { ptr.as_ptr().read() }, 4);
    assert_eq!(unsafe { ptr.as_ptr().add(stride).read() }, 5);
    bo.unlock().unwrap();
    bo.destroy().unwrap();
}

/// Rectangles outside the buffer are refused.
#[test]
fn test_lock_out_of_bounds() {
    let (_kernel, device) = open();
    let bo = device
        .create_buffer(32, 32, PixelFormat::Rgb565, CPU)
        .unwrap();

    for rect in [
        Rect::new(0, 0, 33, 1),
        Rect::new(31, 31, 2, 2),
        Rect::new(0, 0, 0, 10),
        Rect::new(u32::MAX, 0, 1, 1),
    ] {
        assert!(
            matches!(bo.lock(rect, false), Err(Error::OutOfBounds(_))),
            "{rect:?}"
        );
    }
    assert!(!bo.is_locked());
    bo.destroy().unwrap();
}

// ============================================================================
// Destroy
// ============================================================================

/// Destroying a locked buffer is refused and changes nothing.
#[test]
fn test_destroy_while_locked() {
    let (kernel, device) = open();
    let bo = device
        .create_buffer(16, 16, PixelFormat::Rgba8888, CPU)
        .unwrap();
    bo.lock(Rect::new(0, 0, 16, 16), true).unwrap();

    assert!(matches!(bo.destroy(), Err(Error::BufferBusy(_))));
    assert_eq!(kernel.object_count(), 1);
    assert_eq!(bo.refcount(), 1);
    assert_eq!(device.buffer_count(), 1);

    bo.unlock().unwrap();
    bo.destroy().unwrap();
    assert_eq!(kernel.object_count(), 0);
    assert!(bo.is_destroyed());
    assert_eq!(bo.refcount(), 0);
}

/// Operations on a destroyed buffer fail instead of touching freed state.
#[test]
fn test_use_after_destroy() {
    let (_kernel, device) = open();
    let bo = device
        .create_buffer(16, 16, PixelFormat::Rgba8888, CPU)
        .unwrap();
    bo.destroy().unwrap();

    assert!(matches!(bo.destroy(), Err(Error::Destroyed)));
    assert!(matches!(
        bo.lock(Rect::new(0, 0, 1, 1), false),
        Err(Error::Destroyed)
    ));
    assert!(matches!(bo.unlock(), Err(Error::Destroyed)));
}

/// Allocation limits surface as resource exhaustion.
#[test]
fn test_out_of_memory() {
    let kernel = EmulatedKernel::new(KernelConfig::default().with_max_total_memory(1 << 20));
    let device = Device::open(kernel.connect().unwrap()).unwrap();

    let big = device
        .create_buffer(512, 512, PixelFormat::Rgba8888, CPU)
        .unwrap();
    let err = device
        .create_buffer(512, 512, PixelFormat::Rgba8888, CPU)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    assert_eq!(device.buffer_count(), 1);

    big.destroy().unwrap();
    assert!(device
        .create_buffer(512, 512, PixelFormat::Rgba8888, CPU)
        .is_ok());
}

// ============================================================================
// Export / Import in one process
// ============================================================================

/// Importing our own export shares the wrapper and bumps the count.
#[test]
fn test_export_import_same_process() {
    let (kernel, device) = open();
    let bo = device
        .create_buffer(100, 50, PixelFormat::Bgra8888, CPU)
        .unwrap();
    let (handle, stride) = bo.export();
    assert_eq!(stride, bo.stride());

    let imported = device.register_handle(&handle).unwrap();
    assert!(Arc::ptr_eq(&bo, &imported));
    assert_eq!(imported.width(), 100);
    assert_eq!(imported.height(), 50);
    assert_eq!(imported.format(), PixelFormat::Bgra8888);
    assert_eq!(imported.stride(), stride);
    assert_eq!(bo.refcount(), 2);
    assert_eq!(kernel.object_count(), 1);
    assert_eq!(device.buffer_count(), 1);

    let found = device.buffer_from_handle(&handle).unwrap();
    assert!(Arc::ptr_eq(&bo, &found));
    assert_eq!(bo.refcount(), 2);

    device.unregister_handle(&handle).unwrap();
    assert_eq!(bo.refcount(), 1);
    assert!(!bo.is_destroyed());

    bo.destroy().unwrap();
    assert_eq!(kernel.object_count(), 0);
    assert!(matches!(
        device.unregister_handle(&handle),
        Err(Error::UnknownHandle(_))
    ));
}

/// A handle round-trips through its wire encoding unchanged.
#[test]
fn test_handle_encoding_preserves_metadata() {
    let (_kernel, device) = open();
    let bo = device
        .create_buffer(640, 480, PixelFormat::YCrCb420Sp, BufferUsage::HW_TEXTURE)
        .unwrap();

    let bytes = bo.handle().encode();
    let decoded = kmsalloc::BufferHandle::decode(&bytes).unwrap();
    assert_eq!(decoded, bo.handle());
    assert_eq!(decoded.header(), bo.header());
    bo.destroy().unwrap();
}
