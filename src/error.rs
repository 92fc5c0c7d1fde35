//! Error types for kmsalloc.

use thiserror::Error;

/// Result type alias using kmsalloc's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`].
///
/// Callers use this to decide whether a failure is worth retrying (after
/// acquiring authorization, for instance) or indicates a programming error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The kernel denied an allocation or mapping.
    ResourceExhaustion,
    /// Master ownership or authentication is missing.
    Authorization,
    /// The caller broke the API contract (unbalanced lock, busy destroy, ...).
    ContractViolation,
    /// A received handle carries inconsistent metadata.
    CorruptHandle,
    /// The format, usage or geometry cannot be served.
    Unsupported,
    /// The operation is not valid in the current state.
    InvalidState,
    /// The kernel connection itself failed.
    Transport,
}

/// Main error type for kmsalloc operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The kernel has no memory left for the request.
    #[error("out of graphics memory: requested {requested} bytes")]
    OutOfMemory {
        /// Number of bytes requested.
        requested: usize,
    },

    /// Memory allocation failed.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// Establishing a CPU mapping failed.
    #[error("mapping failed: {0}")]
    MapFailed(String),

    /// The connection is not the display master.
    #[error("connection is not the display master")]
    NotMaster,

    /// Another connection already holds display mastership.
    #[error("display master is held by another connection")]
    MasterBusy,

    /// The authentication token is unknown to the kernel.
    #[error("authentication failed for magic {0:#x}")]
    AuthenticationFailed(u32),

    /// The connection has not been authenticated by the display master.
    #[error("connection is not authenticated")]
    NotAuthenticated,

    /// The buffer is already locked for CPU access.
    #[error("buffer is already locked")]
    AlreadyLocked,

    /// Unlock without a matching lock.
    #[error("buffer is not locked")]
    NotLocked,

    /// The buffer cannot be destroyed in its current state.
    #[error("buffer busy: {0}")]
    BufferBusy(String),

    /// The device still owns live buffers.
    #[error("{0} buffer(s) still alive")]
    BuffersAlive(usize),

    /// The handle was never registered in this process.
    #[error("unknown handle (name {0})")]
    UnknownHandle(u32),

    /// The buffer or device has already been torn down.
    #[error("object already destroyed")]
    Destroyed,

    /// Handle metadata is corrupt or inconsistent.
    #[error("corrupt handle: {0}")]
    CorruptHandle(String),

    /// Pixel format value is not recognized or not allowed here.
    #[error("unsupported pixel format {0:#x}")]
    UnsupportedFormat(i32),

    /// Usage flags cannot be honored.
    #[error("unsupported usage: {0}")]
    UnsupportedUsage(String),

    /// Width or height is out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A lock rectangle falls outside the buffer.
    #[error("rectangle out of bounds: {0}")]
    OutOfBounds(String),

    /// CPU access is refused while the buffer is being scanned out.
    #[error("buffer is attached to scanout and the hardware forbids CPU access")]
    ScanoutBusy,

    /// The operation is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The buffer has no framebuffer attached.
    #[error("buffer has no framebuffer attached")]
    NotAttached,

    /// The device node cannot be opened.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfMemory { .. } | Error::AllocationFailed(_) | Error::MapFailed(_) => {
                ErrorKind::ResourceExhaustion
            }
            Error::NotMaster
            | Error::MasterBusy
            | Error::AuthenticationFailed(_)
            | Error::NotAuthenticated => ErrorKind::Authorization,
            Error::AlreadyLocked
            | Error::NotLocked
            | Error::BufferBusy(_)
            | Error::BuffersAlive(_)
            | Error::UnknownHandle(_)
            | Error::Destroyed => ErrorKind::ContractViolation,
            Error::CorruptHandle(_) => ErrorKind::CorruptHandle,
            Error::UnsupportedFormat(_)
            | Error::UnsupportedUsage(_)
            | Error::InvalidGeometry(_)
            | Error::OutOfBounds(_) => ErrorKind::Unsupported,
            Error::ScanoutBusy | Error::InvalidState(_) | Error::NotAttached => {
                ErrorKind::InvalidState
            }
            Error::DeviceUnavailable(_) | Error::Io(_) | Error::System(_) => ErrorKind::Transport,
        }
    }

    /// Whether this error signals a caller bug rather than a runtime condition.
    pub fn is_contract_violation(&self) -> bool {
        self.kind() == ErrorKind::ContractViolation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::OutOfMemory { requested: 1 }.kind(),
            ErrorKind::ResourceExhaustion
        );
        assert_eq!(Error::MasterBusy.kind(), ErrorKind::Authorization);
        assert_eq!(Error::AlreadyLocked.kind(), ErrorKind::ContractViolation);
        assert_eq!(
            Error::CorruptHandle("bad".into()).kind(),
            ErrorKind::CorruptHandle
        );
        assert_eq!(Error::NotAttached.kind(), ErrorKind::InvalidState);
        assert_eq!(
            Error::System(rustix::io::Errno::NOENT).kind(),
            ErrorKind::Transport
        );
    }

    #[test]
    fn test_contract_violation() {
        assert!(Error::UnknownHandle(7).is_contract_violation());
        assert!(!Error::NotMaster.is_contract_violation());
    }

    #[test]
    fn test_display() {
        let msg = Error::AuthenticationFailed(0x2a).to_string();
        assert!(msg.contains("0x2a"));
    }
}
