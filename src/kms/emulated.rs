//! In-process emulation of the kernel memory manager and display subsystem.
//!
//! [`EmulatedKernel`] stands in for one machine's graphics device. Each
//! [`EmulatedConnection`] is one open file on that device, the way each
//! process holds its own DRM fd. Memory objects are memfd-backed, so every
//! connection that maps an object sees the same physical pages.
//!
//! The emulation enforces the rules the allocator depends on:
//!
//! - the first connection becomes display master if nobody holds it
//! - exporting, importing and framebuffer registration need authentication
//! - modesets and flips need mastership
//! - at most one flip is queued; it completes on the next vblank boundary
//! - objects live until the last handle and the last framebuffer are gone
//!
//! # Example
//!
//! ```rust
//! use kmsalloc::kms::{EmulatedKernel, KernelConfig, KmsBackend};
//!
//! let kernel = EmulatedKernel::new(KernelConfig::default());
//! let conn = kernel.connect().unwrap();
//! assert!(conn.is_master());
//!
//! let handle = conn.create_object(4096).unwrap();
//! conn.close_object(handle).unwrap();
//! assert_eq!(kernel.object_count(), 0);
//! ```

use super::{AuthMagic, FramebufferId, FramebufferSpec, GemHandle, KmsBackend, KmsInfo};
use crate::error::{Error, Result};
use crate::format::{
    DRM_FORMAT_ABGR8888, DRM_FORMAT_ARGB8888, DRM_FORMAT_RGB565, DRM_FORMAT_XBGR8888,
    PixelFormat,
};
use crate::memory::CpuMapping;
use rustix::fd::{AsFd, OwnedFd};
use rustix::io::Errno;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// First connection id; mimics the first free fd after stdio.
const FIRST_CONNECTION_ID: u32 = 3;

/// First authentication token handed out.
const FIRST_MAGIC: u32 = 0x1000;

/// Parameters of the emulated display hardware.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Active mode width in pixels.
    pub mode_width: u32,
    /// Active mode height in pixels.
    pub mode_height: u32,
    /// Refresh rate in Hz.
    pub refresh_hz: u32,
    /// Whether presentation may overlap the previous frame's scanout.
    pub pipelined: bool,
    /// Whether an attached buffer may be mapped by the CPU.
    pub cpu_access_during_scanout: bool,
    /// Framebuffer pitch alignment in bytes.
    pub pitch_alignment: u32,
    /// Largest single object in bytes.
    pub max_object_size: usize,
    /// Total memory the device can hand out.
    pub max_total_memory: usize,
    /// Physical panel width, for DPI.
    pub physical_width_mm: u32,
    /// Physical panel height, for DPI.
    pub physical_height_mm: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mode_width: 1920,
            mode_height: 1080,
            refresh_hz: 60,
            pipelined: false,
            cpu_access_during_scanout: true,
            pitch_alignment: 64,
            max_object_size: 256 * 1024 * 1024,
            max_total_memory: 1024 * 1024 * 1024,
            physical_width_mm: 527,
            physical_height_mm: 296,
        }
    }
}

impl KernelConfig {
    /// Hardware that can queue a flip while the previous frame is on screen.
    pub fn pipelined() -> Self {
        Self {
            pipelined: true,
            ..Self::default()
        }
    }

    /// Hardware that locks out the CPU while a buffer is attached to scanout.
    pub fn exclusive_scanout() -> Self {
        Self {
            cpu_access_during_scanout: false,
            ..Self::default()
        }
    }

    /// Set the refresh rate.
    pub fn with_refresh_hz(mut self, hz: u32) -> Self {
        self.refresh_hz = hz.max(1);
        self
    }

    /// Set the pipelined capability.
    pub fn with_pipelined(mut self, pipelined: bool) -> Self {
        self.pipelined = pipelined;
        self
    }

    /// Set the total memory limit.
    pub fn with_max_total_memory(mut self, bytes: usize) -> Self {
        self.max_total_memory = bytes;
        self
    }

    /// Set the single-object size limit.
    pub fn with_max_object_size(mut self, bytes: usize) -> Self {
        self.max_object_size = bytes;
        self
    }

    /// Set the framebuffer pitch alignment.
    pub fn with_pitch_alignment(mut self, alignment: u32) -> Self {
        self.pitch_alignment = alignment.max(1);
        self
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.refresh_hz.max(1)))
    }

    fn dpi(pixels: u32, mm: u32) -> f32 {
        if mm == 0 {
            return 160.0;
        }
        pixels as f32 * 25.4 / mm as f32
    }
}

/// A memory object owned by the emulated kernel.
struct KernelObject {
    fd: OwnedFd,
    size: usize,
    name: Option<u32>,
    /// Connection handles plus framebuffers referencing this object.
    refs: usize,
}

#[derive(Default)]
struct ConnectionState {
    handles: HashMap<u32, u64>,
    next_handle: u32,
    magic: Option<u32>,
    authenticated: bool,
}

struct FramebufferRecord {
    owner: u32,
    object: u64,
}

struct PendingFlip {
    owner: u32,
    fb: u32,
    due: Instant,
}

struct KernelState {
    available: bool,
    next_connection: u32,
    next_object: u64,
    next_name: u32,
    next_framebuffer: u32,
    next_magic: u32,
    objects: HashMap<u64, KernelObject>,
    names: HashMap<u32, u64>,
    connections: HashMap<u32, ConnectionState>,
    framebuffers: HashMap<u32, FramebufferRecord>,
    master: Option<u32>,
    front: Option<u32>,
    pending_flip: Option<PendingFlip>,
    flips_completed: u64,
    memory_in_use: usize,
}

impl KernelState {
    fn new() -> Self {
        Self {
            available: true,
            next_connection: FIRST_CONNECTION_ID,
            next_object: 1,
            next_name: 1,
            next_framebuffer: 1,
            next_magic: FIRST_MAGIC,
            objects: HashMap::new(),
            names: HashMap::new(),
            connections: HashMap::new(),
            framebuffers: HashMap::new(),
            master: None,
            front: None,
            pending_flip: None,
            flips_completed: 0,
            memory_in_use: 0,
        }
    }

    fn connection(&mut self, conn: u32) -> Result<&mut ConnectionState> {
        self.connections.get_mut(&conn).ok_or(Error::System(Errno::BADF))
    }

    fn is_authenticated(&self, conn: u32) -> bool {
        self.master == Some(conn)
            || self
                .connections
                .get(&conn)
                .is_some_and(|c| c.authenticated)
    }

    fn require_auth(&self, conn: u32) -> Result<()> {
        if self.is_authenticated(conn) {
            Ok(())
        } else {
            Err(Error::NotAuthenticated)
        }
    }

    fn require_master(&self, conn: u32) -> Result<()> {
        if self.master == Some(conn) {
            Ok(())
        } else {
            Err(Error::NotMaster)
        }
    }

    fn object_of(&mut self, conn: u32, handle: GemHandle) -> Result<u64> {
        self.connection(conn)?
            .handles
            .get(&handle.0)
            .copied()
            .ok_or(Error::System(Errno::NOENT))
    }

    fn add_handle(&mut self, conn: u32, object: u64) -> Result<GemHandle> {
        let state = self.connection(conn)?;
        state.next_handle += 1;
        let handle = state.next_handle;
        state.handles.insert(handle, object);
        Ok(GemHandle(handle))
    }

    fn unref_object(&mut self, id: u64) {
        let Some(object) = self.objects.get_mut(&id) else {
            return;
        };
        object.refs -= 1;
        if object.refs == 0 {
            if let Some(object) = self.objects.remove(&id) {
                if let Some(name) = object.name {
                    self.names.remove(&name);
                }
                self.memory_in_use -= object.size;
                tracing::trace!(object = id, size = object.size, "kernel object freed");
            }
        }
    }

    fn remove_framebuffer(&mut self, fb: u32) -> Option<FramebufferRecord> {
        let record = self.framebuffers.remove(&fb)?;
        if self.front == Some(fb) {
            self.front = None;
        }
        if self.pending_flip.as_ref().is_some_and(|p| p.fb == fb) {
            self.pending_flip = None;
        }
        self.unref_object(record.object);
        Some(record)
    }

    fn retire_flip(&mut self, now: Instant) {
        if let Some(pending) = &self.pending_flip {
            if now >= pending.due {
                self.front = Some(pending.fb);
                self.pending_flip = None;
                self.flips_completed += 1;
            }
        }
    }
}

/// One emulated graphics device shared by any number of connections.
pub struct EmulatedKernel {
    config: KernelConfig,
    epoch: Instant,
    state: Mutex<KernelState>,
}

impl EmulatedKernel {
    /// Create a device with the given hardware parameters.
    pub fn new(config: KernelConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            epoch: Instant::now(),
            state: Mutex::new(KernelState::new()),
        })
    }

    /// Open a new connection (the equivalent of opening the device node).
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] while the device is marked
    /// unavailable with [`set_available`](Self::set_available).
    pub fn connect(self: &Arc<Self>) -> Result<EmulatedConnection> {
        let mut state = self.state.lock().unwrap();
        if !state.available {
            return Err(Error::DeviceUnavailable(
                "emulated device node is not available".into(),
            ));
        }
        let id = state.next_connection;
        state.next_connection += 1;
        state.connections.insert(id, ConnectionState::default());
        if state.master.is_none() {
            state.master = Some(id);
        }
        tracing::debug!(connection = id, master = state.master == Some(id), "connection opened");

        Ok(EmulatedConnection {
            kernel: Arc::clone(self),
            id,
        })
    }

    /// Make the device node (un)available to new connections.
    pub fn set_available(&self, available: bool) {
        self.state.lock().unwrap().available = available;
    }

    /// Hardware parameters.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Number of live memory objects.
    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Number of registered framebuffers.
    pub fn framebuffer_count(&self) -> usize {
        self.state.lock().unwrap().framebuffers.len()
    }

    /// Bytes currently allocated.
    pub fn memory_in_use(&self) -> usize {
        self.state.lock().unwrap().memory_in_use
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    /// Framebuffer currently scanned out.
    pub fn front_framebuffer(&self) -> Option<FramebufferId> {
        let mut state = self.state.lock().unwrap();
        state.retire_flip(Instant::now());
        state.front.map(FramebufferId)
    }

    /// Whether a flip is queued but not yet on screen.
    pub fn flip_pending(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.retire_flip(Instant::now());
        state.pending_flip.is_some()
    }

    /// Number of flips that reached the screen.
    pub fn flips_completed(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.retire_flip(Instant::now());
        state.flips_completed
    }

    /// Connection id of the current display master.
    pub fn master(&self) -> Option<i32> {
        self.state.lock().unwrap().master.map(|id| id as i32)
    }

    fn next_vblank(&self, now: Instant) -> Instant {
        let interval = self.config.frame_interval().as_nanos().max(1);
        let elapsed = now.duration_since(self.epoch).as_nanos();
        let ticks = elapsed / interval + 1;
        self.epoch + Duration::from_nanos((ticks * interval) as u64)
    }

    fn disconnect(&self, id: u32) {
        let mut state = self.state.lock().unwrap();
        let Some(conn) = state.connections.remove(&id) else {
            return;
        };
        for object in conn.handles.into_values() {
            state.unref_object(object);
        }
        let owned: Vec<u32> = state
            .framebuffers
            .iter()
            .filter(|(_, fb)| fb.owner == id)
            .map(|(fb, _)| *fb)
            .collect();
        for fb in owned {
            state.remove_framebuffer(fb);
        }
        if state.master == Some(id) {
            state.master = None;
        }
        if state.pending_flip.as_ref().is_some_and(|p| p.owner == id) {
            state.pending_flip = None;
        }
        tracing::debug!(connection = id, "connection closed");
    }
}

impl std::fmt::Debug for EmulatedKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedKernel")
            .field("config", &self.config)
            .field("objects", &self.object_count())
            .field("framebuffers", &self.framebuffer_count())
            .finish()
    }
}

/// Bytes per pixel for the fourccs the emulated display accepts.
fn scanout_cpp(fourcc: u32) -> Option<u32> {
    match fourcc {
        DRM_FORMAT_ABGR8888 | DRM_FORMAT_XBGR8888 | DRM_FORMAT_ARGB8888 => Some(4),
        DRM_FORMAT_RGB565 => Some(2),
        _ => None,
    }
}

/// One open connection to an [`EmulatedKernel`].
///
/// Dropping the connection releases every handle, framebuffer and
/// mastership it held, like closing a device fd.
pub struct EmulatedConnection {
    kernel: Arc<EmulatedKernel>,
    id: u32,
}

impl EmulatedConnection {
    /// The device this connection belongs to.
    pub fn kernel(&self) -> &Arc<EmulatedKernel> {
        &self.kernel
    }

    fn state(&self) -> std::sync::MutexGuard<'_, KernelState> {
        self.kernel.state.lock().unwrap()
    }
}

impl Drop for EmulatedConnection {
    fn drop(&mut self) {
        self.kernel.disconnect(self.id);
    }
}

impl std::fmt::Debug for EmulatedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedConnection")
            .field("id", &self.id)
            .finish()
    }
}

impl KmsBackend for EmulatedConnection {
    fn fd(&self) -> i32 {
        self.id as i32
    }

    fn is_master(&self) -> bool {
        self.state().master == Some(self.id)
    }

    fn get_magic(&self) -> Result<AuthMagic> {
        let mut state = self.state();
        let next = state.next_magic;
        let conn = state.connection(self.id)?;
        let magic = match conn.magic {
            Some(magic) => magic,
            None => {
                conn.magic = Some(next);
                state.next_magic += 1;
                next
            }
        };
        Ok(AuthMagic(magic))
    }

    fn auth_magic(&self, magic: AuthMagic) -> Result<()> {
        let mut state = self.state();
        state.require_master(self.id)?;
        let target = state
            .connections
            .values_mut()
            .find(|c| c.magic == Some(magic.0))
            .ok_or(Error::AuthenticationFailed(magic.0))?;
        target.authenticated = true;
        Ok(())
    }

    fn set_master(&self) -> Result<()> {
        let mut state = self.state();
        match state.master {
            Some(id) if id == self.id => Ok(()),
            Some(_) => Err(Error::MasterBusy),
            None => {
                state.master = Some(self.id);
                Ok(())
            }
        }
    }

    fn drop_master(&self) -> Result<()> {
        let mut state = self.state();
        state.require_master(self.id)?;
        state.master = None;
        Ok(())
    }

    fn create_object(&self, size: usize) -> Result<GemHandle> {
        let config = &self.kernel.config;
        if size == 0 {
            return Err(Error::AllocationFailed("size must be greater than 0".into()));
        }
        if size > config.max_object_size {
            return Err(Error::AllocationFailed(format!(
                "object of {} bytes exceeds the {} byte limit",
                size, config.max_object_size
            )));
        }

        let mut state = self.state();
        if state.memory_in_use + size > config.max_total_memory {
            return Err(Error::OutOfMemory { requested: size });
        }

        let fd = rustix::fs::memfd_create("kmsalloc-object", rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        let id = state.next_object;
        state.next_object += 1;
        state.objects.insert(
            id,
            KernelObject {
                fd,
                size,
                name: None,
                refs: 1,
            },
        );
        state.memory_in_use += size;
        state.add_handle(self.id, id)
    }

    fn flink(&self, handle: GemHandle) -> Result<u32> {
        let mut state = self.state();
        state.require_auth(self.id)?;
        let id = state.object_of(self.id, handle)?;
        let next = state.next_name;
        let object = state.objects.get_mut(&id).ok_or(Error::System(Errno::NOENT))?;
        if let Some(name) = object.name {
            return Ok(name);
        }
        object.name = Some(next);
        state.next_name += 1;
        state.names.insert(next, id);
        Ok(next)
    }

    fn open_object(&self, name: u32) -> Result<(GemHandle, usize)> {
        let mut state = self.state();
        state.require_auth(self.id)?;
        let id = *state.names.get(&name).ok_or(Error::System(Errno::NOENT))?;
        let object = state.objects.get_mut(&id).ok_or(Error::System(Errno::NOENT))?;
        object.refs += 1;
        let size = object.size;
        let handle = state.add_handle(self.id, id)?;
        Ok((handle, size))
    }

    fn close_object(&self, handle: GemHandle) -> Result<()> {
        let mut state = self.state();
        let id = state
            .connection(self.id)?
            .handles
            .remove(&handle.0)
            .ok_or(Error::System(Errno::INVAL))?;
        state.unref_object(id);
        Ok(())
    }

    fn map_object(&self, handle: GemHandle, writable: bool) -> Result<CpuMapping> {
        let mut state = self.state();
        let id = state.object_of(self.id, handle)?;
        let object = state.objects.get(&id).ok_or(Error::System(Errno::NOENT))?;
        CpuMapping::map(object.fd.as_fd(), object.size, writable)
    }

    fn init_kms(&self) -> Result<KmsInfo> {
        let config = &self.kernel.config;
        Ok(KmsInfo {
            width: config.mode_width,
            height: config.mode_height,
            refresh_hz: config.refresh_hz,
            pipelined: config.pipelined,
            cpu_access_during_scanout: config.cpu_access_during_scanout,
            pitch_alignment: config.pitch_alignment,
            xdpi: KernelConfig::dpi(config.mode_width, config.physical_width_mm),
            ydpi: KernelConfig::dpi(config.mode_height, config.physical_height_mm),
            preferred_format: PixelFormat::Rgbx8888,
        })
    }

    fn fini_kms(&self) -> Result<()> {
        Ok(())
    }

    fn add_framebuffer(&self, handle: GemHandle, spec: FramebufferSpec) -> Result<FramebufferId> {
        let config = &self.kernel.config;
        let cpp = scanout_cpp(spec.fourcc).ok_or_else(|| {
            Error::UnsupportedUsage(format!("fourcc {:#x} cannot be scanned out", spec.fourcc))
        })?;
        if spec.width == 0 || spec.height == 0 {
            return Err(Error::InvalidGeometry("framebuffer has no area".into()));
        }
        if spec.pitch % config.pitch_alignment != 0 {
            return Err(Error::InvalidGeometry(format!(
                "pitch {} is not a multiple of {}",
                spec.pitch, config.pitch_alignment
            )));
        }
        if spec.pitch < spec.width * cpp {
            return Err(Error::InvalidGeometry(format!(
                "pitch {} too small for width {}",
                spec.pitch, spec.width
            )));
        }

        let mut state = self.state();
        state.require_auth(self.id)?;
        let id = state.object_of(self.id, handle)?;
        let object = state.objects.get_mut(&id).ok_or(Error::System(Errno::NOENT))?;
        let needed = spec.pitch as usize * spec.height as usize;
        if needed > object.size {
            return Err(Error::InvalidGeometry(format!(
                "framebuffer needs {} bytes, object has {}",
                needed, object.size
            )));
        }
        object.refs += 1;

        let fb = state.next_framebuffer;
        state.next_framebuffer += 1;
        state.framebuffers.insert(
            fb,
            FramebufferRecord {
                owner: self.id,
                object: id,
            },
        );
        Ok(FramebufferId(fb))
    }

    fn remove_framebuffer(&self, fb: FramebufferId) -> Result<()> {
        let mut state = self.state();
        match state.framebuffers.get(&fb.0) {
            Some(record) if record.owner == self.id => {
                state.remove_framebuffer(fb.0);
                Ok(())
            }
            _ => Err(Error::System(Errno::NOENT)),
        }
    }

    fn set_crtc(&self, fb: FramebufferId) -> Result<()> {
        let mut state = self.state();
        state.require_master(self.id)?;
        if !state.framebuffers.contains_key(&fb.0) {
            return Err(Error::System(Errno::NOENT));
        }
        state.pending_flip = None;
        state.front = Some(fb.0);
        Ok(())
    }

    fn page_flip(&self, fb: FramebufferId) -> Result<()> {
        let now = Instant::now();
        let due = self.kernel.next_vblank(now);
        let mut state = self.state();
        state.require_master(self.id)?;
        if !state.framebuffers.contains_key(&fb.0) {
            return Err(Error::System(Errno::NOENT));
        }
        state.retire_flip(now);
        if state.front.is_none() {
            return Err(Error::InvalidState("CRTC is not configured".into()));
        }
        if state.pending_flip.is_some() {
            return Err(Error::InvalidState("a flip is already pending".into()));
        }
        state.pending_flip = Some(PendingFlip {
            owner: self.id,
            fb: fb.0,
            due,
        });
        Ok(())
    }

    fn wait_flip(&self) -> Result<()> {
        loop {
            let now = Instant::now();
            let due = {
                let mut state = self.state();
                state.retire_flip(now);
                match &state.pending_flip {
                    Some(pending) if pending.owner == self.id => pending.due,
                    _ => return Ok(()),
                }
            };
            std::thread::sleep(due.saturating_duration_since(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_kernel() -> Arc<EmulatedKernel> {
        EmulatedKernel::new(KernelConfig::default().with_refresh_hz(1000))
    }

    #[test]
    fn test_first_connection_is_master() {
        let kernel = fast_kernel();
        let a = kernel.connect().unwrap();
        let b = kernel.connect().unwrap();
        assert!(a.is_master());
        assert!(!b.is_master());
        assert_eq!(kernel.master(), Some(a.fd()));
    }

    #[test]
    fn test_master_handover() {
        let kernel = fast_kernel();
        let a = kernel.connect().unwrap();
        let b = kernel.connect().unwrap();

        assert!(matches!(b.set_master(), Err(Error::MasterBusy)));
        a.drop_master().unwrap();
        b.set_master().unwrap();
        assert!(b.is_master());
        assert!(matches!(a.drop_master(), Err(Error::NotMaster)));
    }

    #[test]
    fn test_unavailable_device() {
        let kernel = fast_kernel();
        kernel.set_available(false);
        assert!(matches!(kernel.connect(), Err(Error::DeviceUnavailable(_))));
        kernel.set_available(true);
        assert!(kernel.connect().is_ok());
    }

    #[test]
    fn test_authentication_flow() {
        let kernel = fast_kernel();
        let master = kernel.connect().unwrap();
        let client = kernel.connect().unwrap();

        let handle = client.create_object(4096).unwrap();
        assert!(matches!(client.flink(handle), Err(Error::NotAuthenticated)));

        let magic = client.get_magic().unwrap();
        assert_eq!(client.get_magic().unwrap(), magic);
        assert!(matches!(
            client.auth_magic(magic),
            Err(Error::NotMaster)
        ));
        assert!(matches!(
            master.auth_magic(AuthMagic(0xdead)),
            Err(Error::AuthenticationFailed(0xdead))
        ));

        master.auth_magic(magic).unwrap();
        assert!(client.flink(handle).is_ok());
    }

    #[test]
    fn test_flink_and_open_share_memory() {
        let kernel = fast_kernel();
        let a = kernel.connect().unwrap();
        let b = kernel.connect().unwrap();
        a.auth_magic(b.get_magic().unwrap()).unwrap();

        let handle = a.create_object(8192).unwrap();
        let name = a.flink(handle).unwrap();
        assert_eq!(a.flink(handle).unwrap(), name);

        let (imported, size) = b.open_object(name).unwrap();
        assert_eq!(size, 8192);

        let wa = a.map_object(handle, true).unwrap();
        let rb = b.map_object(imported, false).unwrap();
        unsafe {
            *wa.as_mut_ptr().unwrap().add(10) = 0x5a;
            assert_eq!(rb.as_slice()[10], 0x5a);
        }

        a.close_object(handle).unwrap();
        assert_eq!(kernel.object_count(), 1);
        b.close_object(imported).unwrap();
        assert_eq!(kernel.object_count(), 0);
        assert_eq!(kernel.memory_in_use(), 0);
        assert!(b.open_object(name).is_err());
    }

    #[test]
    fn test_memory_limits() {
        let kernel = EmulatedKernel::new(
            KernelConfig::default()
                .with_max_object_size(4096)
                .with_max_total_memory(8192),
        );
        let conn = kernel.connect().unwrap();

        assert!(matches!(
            conn.create_object(4097),
            Err(Error::AllocationFailed(_))
        ));
        let a = conn.create_object(4096).unwrap();
        let _b = conn.create_object(4096).unwrap();
        assert!(matches!(
            conn.create_object(1),
            Err(Error::OutOfMemory { requested: 1 })
        ));
        conn.close_object(a).unwrap();
        assert!(conn.create_object(1).is_ok());
    }

    #[test]
    fn test_framebuffer_keeps_object_alive() {
        let kernel = fast_kernel();
        let conn = kernel.connect().unwrap();
        let handle = conn.create_object(64 * 16).unwrap();
        let fb = conn
            .add_framebuffer(
                handle,
                FramebufferSpec {
                    width: 16,
                    height: 16,
                    pitch: 64,
                    fourcc: DRM_FORMAT_XBGR8888,
                },
            )
            .unwrap();

        conn.close_object(handle).unwrap();
        assert_eq!(kernel.object_count(), 1);
        conn.remove_framebuffer(fb).unwrap();
        assert_eq!(kernel.object_count(), 0);
    }

    #[test]
    fn test_framebuffer_validation() {
        let kernel = fast_kernel();
        let conn = kernel.connect().unwrap();
        let handle = conn.create_object(4096).unwrap();
        let spec = FramebufferSpec {
            width: 16,
            height: 16,
            pitch: 64,
            fourcc: DRM_FORMAT_XBGR8888,
        };

        let bad_pitch = FramebufferSpec { pitch: 65, ..spec };
        assert!(conn.add_framebuffer(handle, bad_pitch).is_err());

        let bad_format = FramebufferSpec { fourcc: 0, ..spec };
        assert!(matches!(
            conn.add_framebuffer(handle, bad_format),
            Err(Error::UnsupportedUsage(_))
        ));

        let too_tall = FramebufferSpec { height: 128, ..spec };
        assert!(conn.add_framebuffer(handle, too_tall).is_err());
    }

    #[test]
    fn test_flip_sequence() {
        let kernel = fast_kernel();
        let conn = kernel.connect().unwrap();
        let spec = FramebufferSpec {
            width: 16,
            height: 16,
            pitch: 64,
            fourcc: DRM_FORMAT_ARGB8888,
        };
        let h1 = conn.create_object(4096).unwrap();
        let h2 = conn.create_object(4096).unwrap();
        let fb1 = conn.add_framebuffer(h1, spec).unwrap();
        let fb2 = conn.add_framebuffer(h2, spec).unwrap();

        assert!(matches!(
            conn.page_flip(fb1),
            Err(Error::InvalidState(_))
        ));

        conn.set_crtc(fb1).unwrap();
        assert_eq!(kernel.front_framebuffer(), Some(fb1));

        conn.page_flip(fb2).unwrap();
        conn.wait_flip().unwrap();
        assert!(!kernel.flip_pending());
        assert_eq!(kernel.front_framebuffer(), Some(fb2));
        assert!(kernel.flips_completed() >= 1);
    }

    #[test]
    fn test_disconnect_releases_everything() {
        let kernel = fast_kernel();
        let conn = kernel.connect().unwrap();
        let handle = conn.create_object(4096).unwrap();
        let fb = conn
            .add_framebuffer(
                handle,
                FramebufferSpec {
                    width: 16,
                    height: 16,
                    pitch: 64,
                    fourcc: DRM_FORMAT_RGB565,
                },
            )
            .unwrap();
        conn.set_crtc(fb).unwrap();

        drop(conn);
        assert_eq!(kernel.object_count(), 0);
        assert_eq!(kernel.framebuffer_count(), 0);
        assert_eq!(kernel.front_framebuffer(), None);
        assert_eq!(kernel.master(), None);
        assert_eq!(kernel.connection_count(), 0);
    }
}
