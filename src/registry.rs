//! Per-device table of live buffer objects keyed by kernel object name.
//!
//! Every buffer a [`Device`](crate::Device) knows about lives here, whether it
//! was allocated locally or imported from a handle. Keying by the global
//! object name guarantees one wrapper per kernel object: importing a handle
//! whose object is already present bumps that entry's reference count.
//!
//! All mutations happen under the write lock, so the reference count never
//! races with insertion or teardown. Lookups take the read lock only.

use crate::buffer::BufferObject;
use crate::device::DeviceShared;
use crate::error::{Error, Result};
use crate::handle::BufferHandle;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Name-keyed buffer table.
pub(crate) struct HandleRegistry {
    entries: RwLock<HashMap<u32, Arc<BufferObject>>>,
}

impl HandleRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live buffers.
    pub(crate) fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Look up a buffer by object name.
    pub(crate) fn get(&self, name: u32) -> Option<Arc<BufferObject>> {
        self.entries.read().unwrap().get(&name).cloned()
    }

    /// Insert a freshly allocated buffer.
    pub(crate) fn insert(&self, bo: Arc<BufferObject>) -> usize {
        let mut entries = self.entries.write().unwrap();
        entries.insert(bo.name(), bo);
        entries.len()
    }

    /// Register a received handle.
    ///
    /// Retains the existing wrapper when the object is already known,
    /// otherwise imports it with a reference count of one. The `bool` is true
    /// when a new wrapper was created.
    pub(crate) fn register(
        &self,
        shared: &Arc<DeviceShared>,
        handle: &BufferHandle,
    ) -> Result<(Arc<BufferObject>, bool)> {
        let (format, usage) = handle.header().validate()?;

        let mut entries = self.entries.write().unwrap();
        if let Some(bo) = entries.get(&handle.name()) {
            check_header(bo, handle)?;
            bo.retain();
            return Ok((Arc::clone(bo), false));
        }

        let bo = Arc::new(BufferObject::import(shared, handle, format, usage)?);
        entries.insert(handle.name(), Arc::clone(&bo));
        Ok((bo, true))
    }

    /// Resolve a handle to its registered wrapper without touching the
    /// reference count.
    pub(crate) fn resolve(&self, handle: &BufferHandle) -> Result<Arc<BufferObject>> {
        handle.header().validate()?;
        let bo = self
            .get(handle.name())
            .ok_or(Error::UnknownHandle(handle.name()))?;
        check_header(&bo, handle)?;
        Ok(bo)
    }

    /// Drop one reference to `name`, tearing the buffer down at zero.
    ///
    /// When `wrapper` is given, the entry must be that exact wrapper; a stale
    /// wrapper whose name has since been re-imported gets
    /// [`Error::Destroyed`]. Teardown preconditions are checked before the
    /// count changes, so a refused release leaves the entry untouched.
    pub(crate) fn release(
        &self,
        shared: &DeviceShared,
        name: u32,
        wrapper: Option<&BufferObject>,
    ) -> Result<Released> {
        let mut entries = self.entries.write().unwrap();
        let bo = match entries.get(&name) {
            Some(bo) => Arc::clone(bo),
            None => {
                tracing::error!(name = name, "release of unknown handle");
                return Err(Error::UnknownHandle(name));
            }
        };
        if wrapper.is_some_and(|w| !std::ptr::eq(w, Arc::as_ptr(&bo))) {
            tracing::error!(name = name, "release through a stale wrapper");
            return Err(Error::Destroyed);
        }

        let torn_down = bo.release_unless_last();
        if torn_down {
            bo.teardown(shared)?;
            entries.remove(&name);
        }
        Ok(Released {
            live: entries.len(),
            torn_down,
            imported: bo.is_imported(),
        })
    }
}

/// Outcome of [`HandleRegistry::release`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Released {
    /// Entries left in the registry.
    pub(crate) live: usize,
    /// Whether the last reference went and the buffer was torn down.
    pub(crate) torn_down: bool,
    /// Whether the released buffer came from a received handle.
    pub(crate) imported: bool,
}

fn check_header(bo: &BufferObject, handle: &BufferHandle) -> Result<()> {
    if bo.header() != handle.header() {
        return Err(Error::CorruptHandle(format!(
            "header for name {} does not match the registered buffer",
            handle.name()
        )));
    }
    Ok(())
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("len", &self.len())
            .finish()
    }
}
