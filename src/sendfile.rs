//! Platform-abstracted `sendfile(2)`.

use std::io;
use std::os::fd::RawFd;

/// Transfer up to `count` bytes from `in_fd` at `*offset` to the socket
/// `out_fd`. On success the offset is advanced by the number of bytes
/// actually sent and that number is returned; zero means end of file.
///
/// `WouldBlock` and `Interrupted` surface as `io::Error` with the matching
/// kind; callers re-arm writability or retry.
#[cfg(target_os = "linux")]
pub fn sendfile(out_fd: RawFd, in_fd: RawFd, offset: &mut u64, count: usize) -> io::Result<usize> {
    let mut off = *offset as libc::off_t;
    let sent = unsafe { libc::sendfile(out_fd, in_fd, &mut off, count) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    *offset = off as u64;
    Ok(sent as usize)
}

#[cfg(target_os = "macos")]
pub fn sendfile(out_fd: RawFd, in_fd: RawFd, offset: &mut u64, count: usize) -> io::Result<usize> {
    let mut len = count as libc::off_t;
    let rc = unsafe {
        libc::sendfile(
            in_fd,
            out_fd,
            *offset as libc::off_t,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc == -1 && len == 0 {
        return Err(io::Error::last_os_error());
    }
    *offset += len as u64;
    Ok(len as usize)
}
