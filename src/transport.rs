//! Transport abstraction: plain non-blocking socket or TLS stream, with a
//! shared read/write contract and a "what do I need to proceed" hint.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use mio::net::TcpStream;

use crate::buf::ByteBuf64;

#[cfg(feature = "tls")]
use crate::tls::stream::TlsStream;

/// What the transport needs before the operation can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHint {
    /// Progress was made (or, with zero bytes read, orderly close).
    None,
    /// Need the socket readable.
    ReadReady,
    /// Need the socket writable.
    WriteReady,
    /// Fatal transport failure.
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct TransportResult {
    pub bytes: usize,
    pub hint: TransportHint,
}

impl TransportResult {
    pub(crate) fn progress(bytes: usize) -> Self {
        Self {
            bytes,
            hint: TransportHint::None,
        }
    }

    pub(crate) fn blocked(hint: TransportHint) -> Self {
        Self { bytes: 0, hint }
    }
}

/// The closed set of transports a connection can ride on.
pub enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream>),
}

impl Transport {
    pub fn plain(sock: TcpStream) -> Self {
        Self::Plain(sock)
    }

    pub fn raw_fd(&self) -> RawFd {
        match self {
            Self::Plain(sock) => sock.as_raw_fd(),
            #[cfg(feature = "tls")]
            Self::Tls(tls) => tls.raw_fd(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Plain(sock) => sock.peer_addr(),
            #[cfg(feature = "tls")]
            Self::Tls(tls) => tls.peer_addr(),
        }
    }

    /// Read up to `chunk` bytes, appending to `out`.
    ///
    /// `bytes == 0` with hint `None` means orderly close.
    pub fn read(&mut self, out: &mut ByteBuf64, chunk: usize) -> TransportResult {
        match self {
            Self::Plain(sock) => plain_read(sock, out, chunk),
            #[cfg(feature = "tls")]
            Self::Tls(tls) => tls.read(out, chunk),
        }
    }

    /// Write as much of `data` as the transport accepts.
    pub fn write(&mut self, data: &[u8]) -> TransportResult {
        match self {
            Self::Plain(sock) => plain_write(sock, data),
            #[cfg(feature = "tls")]
            Self::Tls(tls) => tls.write(data),
        }
    }

    /// Flush `first` fully before touching `second`; a partial write of the
    /// first buffer must never be followed by bytes of the second.
    pub fn write_two(&mut self, first: &[u8], second: &[u8]) -> TransportResult {
        let head = self.write(first);
        if head.hint != TransportHint::None || head.bytes < first.len() {
            return head;
        }
        if second.is_empty() {
            return head;
        }
        let tail = self.write(second);
        TransportResult {
            bytes: head.bytes + tail.bytes,
            hint: tail.hint,
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("Transport::Plain"),
            #[cfg(feature = "tls")]
            Self::Tls(_) => f.write_str("Transport::Tls"),
        }
    }
}

fn plain_read(sock: &mut TcpStream, out: &mut ByteBuf64, chunk: usize) -> TransportResult {
    let mut scratch = [0u8; 16 * 1024];
    let want = chunk.min(scratch.len());
    loop {
        match sock.read(&mut scratch[..want]) {
            Ok(0) => return TransportResult::progress(0),
            Ok(n) => {
                if out.append(&scratch[..n]).is_err() {
                    return TransportResult::blocked(TransportHint::Error);
                }
                return TransportResult::progress(n);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return TransportResult::blocked(TransportHint::ReadReady);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return TransportResult::blocked(TransportHint::Error),
        }
    }
}

fn plain_write(sock: &mut TcpStream, data: &[u8]) -> TransportResult {
    loop {
        match sock.write(data) {
            Ok(n) => return TransportResult::progress(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return TransportResult::blocked(TransportHint::WriteReady);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return TransportResult::blocked(TransportHint::Error),
        }
    }
}
