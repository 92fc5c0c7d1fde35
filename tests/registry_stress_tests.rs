//! Stress tests for the handle registry.
//!
//! These exercise concurrent registration and release from many threads of
//! one "process" to verify the one-wrapper-per-object invariant and that no
//! kernel references leak.

use kmsalloc::format::{BufferUsage, PixelFormat};
use kmsalloc::kms::{EmulatedKernel, KernelConfig};
use kmsalloc::{BufferObject, Device};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn server_and_client() -> (Arc<EmulatedKernel>, Device, Device) {
    let kernel = EmulatedKernel::new(KernelConfig::default());
    let server = Device::open(kernel.connect().unwrap()).unwrap();
    let client = Device::open(kernel.connect().unwrap()).unwrap();
    server.authenticate(client.get_magic().unwrap()).unwrap();
    (kernel, server, client)
}

// ============================================================================
// Concurrent registration
// ============================================================================

/// Threads racing to register one handle all get the same wrapper.
#[test]
fn test_concurrent_register_same_handle() {
    let (kernel, server, client) = server_and_client();
    let bo = server
        .create_buffer(64, 64, PixelFormat::Rgba8888, BufferUsage::HW_TEXTURE)
        .unwrap();
    let handle = bo.handle();
    let num_threads = 8;
    let barrier = Arc::new(Barrier::new(num_threads));

    let wrappers: Vec<Arc<BufferObject>> = (0..num_threads)
        .map(|_| {
            let client = client.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                client.register_handle(&handle).unwrap()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    for w in &wrappers[1..] {
        assert!(Arc::ptr_eq(&wrappers[0], w));
    }
    assert_eq!(wrappers[0].refcount(), num_threads as u32);
    assert_eq!(client.buffer_count(), 1);
    // One object, referenced by both connections
    assert_eq!(kernel.object_count(), 1);

    for _ in 0..num_threads {
        client.unregister_handle(&handle).unwrap();
    }
    assert!(wrappers[0].is_destroyed());
    bo.destroy().unwrap();
    assert_eq!(kernel.object_count(), 0);
}

/// Many threads register and unregister a pool of handles in a loop.
#[test]
fn test_register_unregister_churn() {
    let (kernel, server, client) = server_and_client();
    let buffers: Vec<_> = (0..16)
        .map(|i| {
            server
                .create_buffer(
                    16 + i,
                    16,
                    PixelFormat::Rgb565,
                    BufferUsage::SW_READ_OFTEN,
                )
                .unwrap()
        })
        .collect();
    let handles: Arc<Vec<_>> = Arc::new(buffers.iter().map(|bo| bo.handle()).collect());

    let num_threads = 8;
    let iterations_per_thread = 500;
    let total_ops = Arc::new(AtomicU64::new(0));

    let workers: Vec<_> = (0..num_threads)
        .map(|thread_id| {
            let client = client.clone();
            let handles = Arc::clone(&handles);
            let total_ops = Arc::clone(&total_ops);
            thread::spawn(move || {
                for i in 0..iterations_per_thread {
                    let handle = &handles[(thread_id * 7 + i) % handles.len()];
                    let bo = client.register_handle(handle).unwrap();
                    assert_eq!(bo.name(), handle.name());
                    assert_eq!(bo.header(), handle.header());
                    client.unregister_handle(handle).unwrap();
                    total_ops.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(
        total_ops.load(Ordering::Relaxed),
        (num_threads * iterations_per_thread) as u64
    );
    assert_eq!(client.buffer_count(), 0);
    assert_eq!(kernel.object_count(), 16);

    for bo in buffers {
        bo.destroy().unwrap();
    }
    assert_eq!(kernel.object_count(), 0);
    assert_eq!(kernel.memory_in_use(), 0);
}

/// Concurrent allocation and destruction on one device.
#[test]
fn test_concurrent_create_destroy() {
    let kernel = EmulatedKernel::new(KernelConfig::default());
    let device = Device::open(kernel.connect().unwrap()).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let device = device.clone();
            thread::spawn(move || {
                for i in 0..200u32 {
                    let bo = device
                        .create_buffer(
                            8 + i % 32,
                            8,
                            PixelFormat::Rgba8888,
                            BufferUsage::SW_WRITE_RARELY,
                        )
                        .unwrap();
                    bo.destroy().unwrap();
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(device.buffer_count(), 0);
    assert_eq!(kernel.object_count(), 0);
    device.destroy().unwrap();
}
