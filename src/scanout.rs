//! Display integration: mode-setting state, framebuffers and presentation.
//!
//! # State Machine
//!
//! The device's mode-setting state:
//!
//! ```text
//!  Uninitialized ──init_kms──► Initialized ──fini_kms──► Finalized
//!                                   ▲                         │
//!                                   └─────────init_kms────────┘
//! ```
//!
//! Each buffer is either without a framebuffer or attached:
//!
//! ```text
//!  NoFramebuffer ──attach──► Attached ──post──► Attached (on screen)
//!        ▲                      │
//!        └───────detach─────────┘
//! ```
//!
//! The first `post` after initialization programs the CRTC; later posts
//! queue page flips. At most one flip is in flight. On pipelined hardware
//! `post` returns once the flip is queued; otherwise it waits for the flip
//! to reach the screen.

use crate::buffer::BufferObject;
use crate::device::DeviceShared;
use crate::error::{Error, Result};
use crate::kms::{FramebufferId, FramebufferSpec, KmsInfo};
use crate::observability::{span_scanout, trace_scanout_state};

/// Mode-setting state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScanoutState {
    /// `init_kms` has not been called.
    #[default]
    Uninitialized,
    /// Display resources are available.
    Initialized,
    /// `fini_kms` released the display resources.
    Finalized,
}

impl std::fmt::Display for ScanoutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScanoutState::Uninitialized => "Uninitialized",
            ScanoutState::Initialized => "Initialized",
            ScanoutState::Finalized => "Finalized",
        };
        f.write_str(name)
    }
}

/// Per-device display bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct KmsState {
    pub(crate) state: ScanoutState,
    /// Last display description; kept after finalization.
    info: Option<KmsInfo>,
    /// Framebuffer on screen, or about to be once `pending` retires.
    front: Option<FramebufferId>,
    /// Flip queued with the kernel and not yet waited for.
    pending: Option<FramebufferId>,
}

impl KmsState {
    fn require_initialized(&self) -> Result<KmsInfo> {
        match (self.state, self.info) {
            (ScanoutState::Initialized, Some(info)) => Ok(info),
            (state, _) => Err(Error::InvalidState(format!(
                "mode-setting is {}",
                state
            ))),
        }
    }
}

impl DeviceShared {
    /// Wait for the queued flip, if any, and promote it to the front buffer.
    fn settle_flip(&self, kms: &mut KmsState) -> Result<()> {
        if let Some(fb) = kms.pending {
            self.backend.wait_flip()?;
            kms.pending = None;
            kms.front = Some(fb);
        }
        Ok(())
    }

    pub(crate) fn init_kms(&self) -> Result<()> {
        let mut kms = self.kms.lock().unwrap();
        if kms.state == ScanoutState::Initialized {
            return Ok(());
        }

        let _span = self
            .config
            .tracing
            .scanout_spans
            .then(|| span_scanout(self.backend.fd(), "init").entered());
        let info = self.backend.init_kms()?;
        tracing::info!(
            width = info.width,
            height = info.height,
            refresh = info.refresh_hz,
            pipelined = info.pipelined,
            "mode-setting initialized"
        );
        trace_scanout_state(
            self.backend.fd(),
            &kms.state.to_string(),
            &ScanoutState::Initialized.to_string(),
        );
        kms.info = Some(info);
        kms.front = None;
        kms.pending = None;
        kms.state = ScanoutState::Initialized;
        Ok(())
    }

    pub(crate) fn fini_kms(&self) -> Result<()> {
        let mut kms = self.kms.lock().unwrap();
        if kms.state != ScanoutState::Initialized {
            return Ok(());
        }

        self.settle_flip(&mut kms)?;
        self.backend.fini_kms()?;
        trace_scanout_state(
            self.backend.fd(),
            &kms.state.to_string(),
            &ScanoutState::Finalized.to_string(),
        );
        kms.front = None;
        kms.state = ScanoutState::Finalized;
        Ok(())
    }

    pub(crate) fn scanout_state(&self) -> ScanoutState {
        self.kms.lock().unwrap().state
    }

    pub(crate) fn kms_info(&self) -> Result<KmsInfo> {
        self.kms.lock().unwrap().require_initialized()
    }

    /// Whether CPU mappings are allowed on attached buffers. Defaults to
    /// true before the display has been queried.
    pub(crate) fn cpu_access_during_scanout(&self) -> bool {
        self.kms
            .lock()
            .unwrap()
            .info
            .is_none_or(|info| info.cpu_access_during_scanout)
    }

    /// Unregister a framebuffer, first retiring it from the screen.
    pub(crate) fn remove_framebuffer(&self, fb: FramebufferId) -> Result<()> {
        let mut kms = self.kms.lock().unwrap();
        if kms.pending.is_some() && (kms.pending == Some(fb) || kms.front == Some(fb)) {
            self.settle_flip(&mut kms)?;
        }
        if kms.front == Some(fb) {
            kms.front = None;
        }
        self.backend.remove_framebuffer(fb)
    }
}

impl BufferObject {
    /// Whether this buffer is meant to be scanned out.
    ///
    /// True iff the usage includes [`HW_FB`](crate::format::BufferUsage::HW_FB)
    /// and the format is presentable.
    pub fn needs_framebuffer(&self) -> bool {
        self.usage().is_scanout() && self.format().is_presentable()
    }

    /// Register the buffer with the display as a framebuffer.
    ///
    /// No-op if already attached.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless mode-setting is initialized.
    /// - [`Error::UnsupportedFormat`] if the format cannot be scanned out.
    /// - [`Error::UnsupportedUsage`] if the stride violates the display's
    ///   pitch alignment.
    /// - [`Error::NotAuthenticated`] if the connection is not trusted.
    pub fn attach(&self) -> Result<FramebufferId> {
        let device = self.device()?;
        let mut state = self.state.lock().unwrap();
        state.ensure_alive()?;
        if let Some(fb) = state.framebuffer {
            return Ok(fb);
        }

        let info = device.kms.lock().unwrap().require_initialized()?;
        let fourcc = self
            .format()
            .drm_fourcc()
            .ok_or(Error::UnsupportedFormat(self.format().as_raw()))?;
        if self.stride() % info.pitch_alignment != 0 {
            return Err(Error::UnsupportedUsage(format!(
                "stride {} is not a multiple of the display pitch alignment {}",
                self.stride(),
                info.pitch_alignment
            )));
        }

        let fb = device.backend.add_framebuffer(
            self.gem(),
            FramebufferSpec {
                width: self.width(),
                height: self.height(),
                pitch: self.stride(),
                fourcc,
            },
        )?;
        device.metrics.record_framebuffer();
        tracing::debug!(name = self.name(), fb = fb.0, "framebuffer attached");
        state.framebuffer = Some(fb);
        Ok(fb)
    }

    /// Unregister the framebuffer. No-op if not attached.
    ///
    /// Detaching the buffer currently on screen is allowed; the display
    /// then has no front buffer until the next `post`.
    pub fn detach(&self) -> Result<()> {
        let device = self.device()?;
        let mut state = self.state.lock().unwrap();
        let Some(fb) = state.framebuffer else {
            return Ok(());
        };
        device.remove_framebuffer(fb)?;
        tracing::debug!(name = self.name(), fb = fb.0, "framebuffer detached");
        state.framebuffer = None;
        Ok(())
    }

    /// Present the buffer on the next vertical blank.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAttached`] if the buffer has no framebuffer.
    /// - [`Error::InvalidState`] unless mode-setting is initialized.
    /// - [`Error::NotMaster`] if the connection is not the display master.
    pub fn post(&self) -> Result<()> {
        let device = self.device()?;
        let state = self.state.lock().unwrap();
        state.ensure_alive()?;
        let fb = state.framebuffer.ok_or(Error::NotAttached)?;

        let mut kms = device.kms.lock().unwrap();
        let info = kms.require_initialized()?;
        let _span = device
            .config
            .tracing
            .scanout_spans
            .then(|| span_scanout(device.backend.fd(), "post").entered());
        let timer = device.metrics.start_post();

        if kms.front.is_none() {
            device.backend.set_crtc(fb)?;
            kms.front = Some(fb);
            tracing::debug!(fb = fb.0, "modeset");
        } else {
            device.settle_flip(&mut kms)?;
            device.backend.page_flip(fb)?;
            kms.pending = Some(fb);
            if !info.pipelined {
                device.settle_flip(&mut kms)?;
            }
            tracing::trace!(fb = fb.0, pipelined = info.pipelined, "flip queued");
        }

        timer.complete();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Device;
    use crate::format::{BufferUsage, PixelFormat};
    use crate::kms::{EmulatedKernel, KernelConfig};
    use std::sync::Arc;

    fn setup(config: KernelConfig) -> (Arc<EmulatedKernel>, Device) {
        let kernel = EmulatedKernel::new(config);
        let device = Device::open(kernel.connect().unwrap()).unwrap();
        (kernel, device)
    }

    fn fast() -> KernelConfig {
        KernelConfig::default().with_refresh_hz(1000)
    }

    fn scanout_buffer(device: &Device) -> Arc<BufferObject> {
        device
            .create_buffer(64, 32, PixelFormat::Rgbx8888, BufferUsage::HW_FB)
            .unwrap()
    }

    #[test]
    fn test_state_transitions() {
        let (_kernel, device) = setup(fast());
        assert_eq!(device.scanout_state(), ScanoutState::Uninitialized);
        assert!(device.kms_info().is_err());

        device.init_kms().unwrap();
        device.init_kms().unwrap();
        assert_eq!(device.scanout_state(), ScanoutState::Initialized);
        assert_eq!(device.kms_info().unwrap().width, 1920);

        device.fini_kms().unwrap();
        assert_eq!(device.scanout_state(), ScanoutState::Finalized);
        assert!(device.is_pipelined().is_err());

        device.init_kms().unwrap();
        assert!(device.is_kms_initialized());
    }

    #[test]
    fn test_needs_framebuffer() {
        let (_kernel, device) = setup(fast());
        let fb = scanout_buffer(&device);
        let sw = device
            .create_buffer(64, 32, PixelFormat::Rgbx8888, BufferUsage::SW_READ_OFTEN)
            .unwrap();
        assert!(fb.needs_framebuffer());
        assert!(!sw.needs_framebuffer());
        fb.destroy().unwrap();
        sw.destroy().unwrap();
    }

    #[test]
    fn test_attach_requires_initialized() {
        let (kernel, device) = setup(fast());
        let bo = scanout_buffer(&device);
        assert!(matches!(bo.attach(), Err(Error::InvalidState(_))));

        device.init_kms().unwrap();
        let fb = bo.attach().unwrap();
        assert_eq!(bo.attach().unwrap(), fb);
        assert_eq!(kernel.framebuffer_count(), 1);

        bo.detach().unwrap();
        bo.detach().unwrap();
        assert_eq!(kernel.framebuffer_count(), 0);
        assert!(bo.attach().is_ok());

        bo.destroy().unwrap();
        assert_eq!(kernel.framebuffer_count(), 0);
    }

    #[test]
    fn test_attach_rejects_unpresentable_format() {
        let (_kernel, device) = setup(fast());
        device.init_kms().unwrap();
        let bo = device
            .create_buffer(64, 32, PixelFormat::Rgb888, BufferUsage::SW_READ_OFTEN)
            .unwrap();
        assert!(matches!(bo.attach(), Err(Error::UnsupportedFormat(_))));
        bo.destroy().unwrap();
    }

    #[test]
    fn test_attach_rejects_misaligned_pitch() {
        let (_kernel, device) = setup(fast().with_pitch_alignment(512));
        device.init_kms().unwrap();
        let bo = scanout_buffer(&device);
        assert!(matches!(bo.attach(), Err(Error::UnsupportedUsage(_))));
        bo.destroy().unwrap();
    }

    #[test]
    fn test_post_without_attach() {
        let (_kernel, device) = setup(fast());
        device.init_kms().unwrap();
        let bo = scanout_buffer(&device);
        assert!(matches!(bo.post(), Err(Error::NotAttached)));
        bo.destroy().unwrap();
    }

    #[test]
    fn test_post_modeset_then_flip() {
        let (kernel, device) = setup(fast());
        device.init_kms().unwrap();
        let a = scanout_buffer(&device);
        let b = scanout_buffer(&device);
        let fa = a.attach().unwrap();
        let fb = b.attach().unwrap();

        a.post().unwrap();
        assert_eq!(kernel.front_framebuffer(), Some(fa));

        b.post().unwrap();
        assert_eq!(kernel.front_framebuffer(), Some(fb));
        assert_eq!(kernel.flips_completed(), 1);

        a.destroy().unwrap();
        b.destroy().unwrap();
    }

    #[test]
    fn test_pipelined_post_returns_before_flip() {
        let (kernel, device) = setup(KernelConfig::pipelined().with_refresh_hz(1));
        device.init_kms().unwrap();
        assert!(device.is_pipelined().unwrap());

        let a = scanout_buffer(&device);
        let b = scanout_buffer(&device);
        a.attach().unwrap();
        b.attach().unwrap();
        a.post().unwrap();

        // 1 Hz refresh: the flip cannot complete before post returns.
        b.post().unwrap();
        assert!(kernel.flip_pending());

        // Detaching the pending buffer waits for the flip first.
        b.detach().unwrap();
        assert!(!kernel.flip_pending());
        a.destroy().unwrap();
        b.destroy().unwrap();
    }

    #[test]
    fn test_cpu_lock_during_exclusive_scanout() {
        let (_kernel, device) = setup(KernelConfig::exclusive_scanout());
        device.init_kms().unwrap();
        let bo = scanout_buffer(&device);
        let rect = crate::Rect::new(0, 0, 64, 32);

        assert!(bo.lock(rect, true).is_ok());
        bo.unlock().unwrap();

        bo.attach().unwrap();
        assert!(matches!(bo.lock(rect, true), Err(Error::ScanoutBusy)));
        bo.detach().unwrap();
        assert!(bo.lock(rect, true).is_ok());
        bo.unlock().unwrap();
        bo.destroy().unwrap();
    }
}
