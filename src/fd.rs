//! RAII ownership of a process file descriptor.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// Move-only owner of a file descriptor with explicit release and an
/// idempotent close.
///
/// Std's [`OwnedFd`] already closes on drop; this wrapper adds the ability
/// to close early (and observe it happened) and to release ownership to
/// code that passes the raw descriptor across an API boundary.
#[derive(Debug)]
pub struct Fd(Option<OwnedFd>);

impl Fd {
    #[must_use]
    pub fn from_owned(fd: OwnedFd) -> Self {
        Self(Some(fd))
    }

    /// Take ownership of a raw descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be open and not owned elsewhere.
    #[must_use]
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self(Some(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.0.is_some()
    }

    #[inline]
    #[must_use]
    pub fn raw(&self) -> RawFd {
        self.0.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    /// Close now. Calling again is a no-op.
    pub fn close(&mut self) {
        self.0 = None;
    }

    /// Give up ownership; the caller becomes responsible for closing.
    #[must_use]
    pub fn release(&mut self) -> RawFd {
        self.0.take().map_or(-1, IntoRawFd::into_raw_fd)
    }
}

impl From<File> for Fd {
    fn from(file: File) -> Self {
        Self(Some(file.into()))
    }
}

impl From<OwnedFd> for Fd {
    fn from(fd: OwnedFd) -> Self {
        Self(Some(fd))
    }
}
