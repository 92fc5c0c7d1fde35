//! Passing buffer handles between processes over Unix domain sockets.
//!
//! A handle is self-contained: the kernel object name is global, so no file
//! descriptor travels with it. Each message is exactly one encoded
//! [`BufferHandle`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::os::unix::net::UnixStream;
//! use kmsalloc::ipc::{recv_handle, send_handle};
//!
//! let (producer, consumer) = UnixStream::pair()?;
//! send_handle(&producer, &bo.handle())?;
//!
//! let handle = recv_handle(&consumer)?;
//! let imported = other_device.register_handle(&handle)?;
//! ```

use crate::error::Result;
use crate::handle::BufferHandle;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

/// Send one handle.
pub fn send_handle(socket: &UnixStream, handle: &BufferHandle) -> Result<()> {
    let mut socket = socket;
    socket.write_all(&handle.encode())?;
    tracing::trace!(name = handle.name(), "handle sent");
    Ok(())
}

/// Receive one handle, blocking until a full record arrives.
///
/// # Errors
///
/// - [`Error::Io`](crate::Error::Io) if the peer hangs up mid-record.
/// - [`Error::CorruptHandle`](crate::Error::CorruptHandle) if the record's
///   framing is invalid.
pub fn recv_handle(socket: &UnixStream) -> Result<BufferHandle> {
    let mut socket = socket;
    let mut buf = [0u8; BufferHandle::ENCODED_LEN];
    socket.read_exact(&mut buf)?;
    let handle = BufferHandle::decode(&buf)?;
    tracing::trace!(name = handle.name(), "handle received");
    Ok(handle)
}
