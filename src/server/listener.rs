//! Listening socket setup.

use std::io;
use std::mem;
use std::os::fd::{FromRawFd, RawFd};

use mio::net::TcpListener;

const LISTEN_BACKLOG: libc::c_int = 1024;

fn set_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            std::ptr::from_ref(&value).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Bind a non-blocking IPv4 listener on `port` (0 = ephemeral). Returns the
/// listener and the actual bound port.
pub(crate) fn bind(port: u16, reuse_port: bool) -> io::Result<(TcpListener, u16)> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // wrap immediately so error paths below close the socket
    let owned = unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) };

    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    if reuse_port {
        set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
    }

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: libc::INADDR_ANY.to_be(),
        },
        sin_zero: [0; 8],
    };
    let rc = unsafe {
        libc::bind(
            fd,
            std::ptr::from_ref(&addr).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::listen(fd, LISTEN_BACKLOG) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut bound: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, std::ptr::from_mut(&mut bound).cast(), &mut len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let actual_port = u16::from_be(bound.sin_port);

    let std_listener = std::net::TcpListener::from(owned);
    Ok((TcpListener::from_std(std_listener), actual_port))
}
