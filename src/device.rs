//! The device context: one connection to the kernel allocator and display.
//!
//! A [`Device`] owns the kernel connection, the authentication and display
//! master state, the mode-setting state, and the registry of every buffer
//! created through it or imported into it. There is no process-wide
//! instance; open as many devices as needed.
//!
//! # Example
//!
//! ```rust
//! use kmsalloc::Device;
//! use kmsalloc::format::{BufferUsage, PixelFormat};
//! use kmsalloc::kms::{EmulatedKernel, KernelConfig};
//!
//! let kernel = EmulatedKernel::new(KernelConfig::default());
//!
//! // The first connection becomes display master.
//! let server = Device::open(kernel.connect().unwrap()).unwrap();
//! let client = Device::open(kernel.connect().unwrap()).unwrap();
//!
//! // The client must be authenticated before it can share buffers.
//! let magic = client.get_magic().unwrap();
//! server.authenticate(magic).unwrap();
//!
//! let bo = client
//!     .create_buffer(320, 240, PixelFormat::Rgb565, BufferUsage::HW_RENDER)
//!     .unwrap();
//! bo.destroy().unwrap();
//! ```

use crate::buffer::BufferObject;
use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::format::{BufferUsage, PixelFormat};
use crate::handle::BufferHandle;
use crate::kms::{AuthMagic, KmsBackend, KmsInfo};
use crate::observability::{
    DeviceMetrics, init_metrics, instrument_device, trace_buffer_destroyed, trace_error,
};
use crate::registry::HandleRegistry;
use crate::scanout::{KmsState, ScanoutState};
use std::sync::{Arc, Mutex};

/// State shared between a device and its buffers.
///
/// Field order matters: buffers go before the connection they were made on.
pub(crate) struct DeviceShared {
    pub(crate) registry: HandleRegistry,
    pub(crate) backend: Box<dyn KmsBackend>,
    pub(crate) config: DeviceConfig,
    pub(crate) metrics: DeviceMetrics,
    pub(crate) kms: Mutex<KmsState>,
}

impl DeviceShared {
    /// Drop one reference to the buffer named `name`, optionally checking
    /// that the registered entry is `wrapper`.
    pub(crate) fn release(&self, name: u32, wrapper: Option<&BufferObject>) -> Result<()> {
        let released = self.registry.release(self, name, wrapper)?;
        if released.torn_down {
            self.metrics.record_destroyed();
            trace_buffer_destroyed(name, released.imported);
        }
        self.metrics.set_live(released.live);
        Ok(())
    }
}

/// A connection to the kernel graphics subsystem.
///
/// Cloning is cheap and yields another reference to the same connection.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    /// Open a device on `backend` with the default configuration.
    ///
    /// # Errors
    ///
    /// Errors from the backend, e.g. [`Error::DeviceUnavailable`] when the
    /// connection itself could not be made.
    pub fn open<B: KmsBackend + 'static>(backend: B) -> Result<Self> {
        Self::open_with_config(backend, DeviceConfig::default())
    }

    /// Open a device with an explicit configuration.
    pub fn open_with_config<B: KmsBackend + 'static>(
        backend: B,
        config: DeviceConfig,
    ) -> Result<Self> {
        config.validate()?;
        init_metrics();
        let fd = backend.fd();
        tracing::info!(fd = fd, master = backend.is_master(), "device opened");

        Ok(Self {
            shared: Arc::new(DeviceShared {
                registry: HandleRegistry::new(),
                backend: Box::new(backend),
                config,
                metrics: DeviceMetrics::new(fd),
                kms: Mutex::new(KmsState::default()),
            }),
        })
    }

    /// Close the device.
    ///
    /// # Errors
    ///
    /// [`Error::BuffersAlive`] if buffers created or imported through this
    /// device have not all been destroyed.
    pub fn destroy(self) -> Result<()> {
        let live = self.shared.registry.len();
        if live > 0 {
            tracing::error!(live = live, "device destroyed with live buffers");
            return Err(Error::BuffersAlive(live));
        }
        self.shared.fini_kms()?;
        tracing::info!(fd = self.fd(), "device closed");
        Ok(())
    }

    /// Configuration in effect.
    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    /// Numeric identity of the kernel connection.
    pub fn fd(&self) -> i32 {
        self.shared.backend.fd()
    }

    /// This connection's authentication token.
    pub fn get_magic(&self) -> Result<AuthMagic> {
        self.shared.backend.get_magic()
    }

    /// Authenticate another connection by its token. Requires mastership.
    pub fn authenticate(&self, magic: AuthMagic) -> Result<()> {
        let _span = instrument_device(self.shared.config.tracing.device_spans, self.fd(), "auth");
        self.shared.backend.auth_magic(magic)?;
        tracing::debug!(magic = magic.0, "connection authenticated");
        Ok(())
    }

    /// Claim display mastership.
    ///
    /// # Errors
    ///
    /// [`Error::MasterBusy`] while another connection holds it.
    pub fn set_master(&self) -> Result<()> {
        self.shared.backend.set_master()?;
        tracing::debug!(fd = self.fd(), "became display master");
        Ok(())
    }

    /// Release display mastership. No-op when not master.
    pub fn drop_master(&self) -> Result<()> {
        if !self.shared.backend.is_master() {
            return Ok(());
        }
        self.shared.backend.drop_master()?;
        tracing::debug!(fd = self.fd(), "dropped display master");
        Ok(())
    }

    /// Whether this connection is the display master.
    pub fn is_master(&self) -> bool {
        self.shared.backend.is_master()
    }

    /// Initialize mode-setting. No-op when already initialized.
    pub fn init_kms(&self) -> Result<()> {
        self.shared.init_kms()
    }

    /// Release mode-setting resources.
    pub fn fini_kms(&self) -> Result<()> {
        self.shared.fini_kms()
    }

    /// Whether mode-setting is initialized.
    pub fn is_kms_initialized(&self) -> bool {
        self.scanout_state() == ScanoutState::Initialized
    }

    /// Current mode-setting state.
    pub fn scanout_state(&self) -> ScanoutState {
        self.shared.scanout_state()
    }

    /// Whether presentation overlaps with the next frame.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless mode-setting is initialized.
    pub fn is_pipelined(&self) -> Result<bool> {
        Ok(self.shared.kms_info()?.pipelined)
    }

    /// Description of the display.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless mode-setting is initialized.
    pub fn kms_info(&self) -> Result<KmsInfo> {
        self.shared.kms_info()
    }

    /// Allocate a new buffer.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidGeometry`] for zero or oversized dimensions.
    /// - [`Error::UnsupportedUsage`] for scanout usage on a format the
    ///   display cannot present.
    /// - [`Error::OutOfMemory`] / [`Error::AllocationFailed`] from the kernel.
    /// - [`Error::NotAuthenticated`] if the connection may not export buffers.
    pub fn create_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<Arc<BufferObject>> {
        let _span = instrument_device(self.shared.config.tracing.device_spans, self.fd(), "create");
        let bo = BufferObject::allocate(&self.shared, width, height, format, usage)
            .inspect_err(|e| trace_error("create", e))?;
        let bo = Arc::new(bo);
        let live = self.shared.registry.insert(Arc::clone(&bo));
        self.shared.metrics.record_allocated(bo.size());
        self.shared.metrics.set_live(live);
        Ok(bo)
    }

    /// Register a handle received from another process.
    ///
    /// If the object is already known, its reference count is incremented
    /// and the existing wrapper returned.
    ///
    /// # Errors
    ///
    /// [`Error::CorruptHandle`] if the header is inconsistent with itself,
    /// with the kernel object, or with the already registered wrapper.
    pub fn register_handle(&self, handle: &BufferHandle) -> Result<Arc<BufferObject>> {
        let _span =
            instrument_device(self.shared.config.tracing.device_spans, self.fd(), "register");
        let (bo, created) = self
            .shared
            .registry
            .register(&self.shared, handle)
            .inspect_err(|e| trace_error("register", e))?;
        if created {
            self.shared.metrics.record_imported();
            self.shared.metrics.set_live(self.shared.registry.len());
        }
        Ok(bo)
    }

    /// Drop one reference taken by [`register_handle`](Self::register_handle)
    /// (or by creation).
    ///
    /// # Errors
    ///
    /// [`Error::UnknownHandle`] if the handle is not registered here.
    pub fn unregister_handle(&self, handle: &BufferHandle) -> Result<()> {
        let _span =
            instrument_device(self.shared.config.tracing.device_spans, self.fd(), "unregister");
        self.shared.release(handle.name(), None)
    }

    /// Look up the wrapper for a registered handle.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownHandle`] if the handle was never registered.
    /// - [`Error::CorruptHandle`] if its header disagrees with the wrapper.
    pub fn buffer_from_handle(&self, handle: &BufferHandle) -> Result<Arc<BufferObject>> {
        self.shared.registry.resolve(handle)
    }

    /// Number of live buffers.
    pub fn buffer_count(&self) -> usize {
        self.shared.registry.len()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("fd", &self.fd())
            .field("master", &self.is_master())
            .field("scanout", &self.scanout_state())
            .field("buffers", &self.buffer_count())
            .finish()
    }
}
