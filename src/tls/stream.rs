//! TLS transport: acceptor-driven handshake, then record-framed I/O.
//!
//! The handshake runs in two stages. A [`rustls::server::Acceptor`] reads
//! the ClientHello so the ALPN decision (including strict-mode rejection)
//! happens before a `ServerConnection` is committed to a config; the
//! connection then completes the handshake non-blocking, one readiness
//! event at a time.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::ServerConnection;
use rustls::server::Acceptor;
use tracing::{debug, trace};

use crate::buf::ByteBuf64;
#[cfg(target_os = "linux")]
use crate::config::KtlsMode;
use crate::tls::context::{self, TlsContext};
use crate::tls::info::TlsInfo;
use crate::tls::reason;
use crate::transport::{TransportHint, TransportResult};

#[cfg(target_os = "linux")]
use crate::tls::ktls;

/// Outcome of one non-blocking handshake step.
pub enum HandshakeOutcome {
    Done(TlsInfo),
    WantRead,
    WantWrite,
    /// Failure with its reason label.
    Fatal(&'static str),
}

/// Result of attempting kernel TLS offload after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KtlsOffload {
    Enabled,
    /// Offload declined cleanly; user-space records continue.
    Fallback(&'static str),
    /// Secrets were already extracted when enabling failed; the connection
    /// cannot continue and must be shut down.
    FatalAfterExtract,
    NotAttempted,
}

enum State {
    Accepting(Acceptor),
    Established(Box<ServerConnection>),
    /// Kernel does record framing; reads and writes go straight to the fd.
    #[cfg(target_os = "linux")]
    Kernel,
    Poisoned,
}

pub struct TlsStream {
    sock: TcpStream,
    state: State,
    context: Arc<TlsContext>,
    sent_close_notify: bool,
}

const WRITE_BUFFER_LIMIT: usize = 256 * 1024;

impl TlsStream {
    pub fn new(sock: TcpStream, context: Arc<TlsContext>) -> Self {
        Self {
            sock,
            state: State::Accepting(Acceptor::default()),
            context,
            sent_close_notify: false,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.sock.peer_addr()
    }

    #[cfg(target_os = "linux")]
    pub fn is_kernel_offloaded(&self) -> bool {
        matches!(self.state, State::Kernel)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn is_kernel_offloaded(&self) -> bool {
        false
    }

    /// Drive the handshake one step.
    pub fn handshake_step(&mut self) -> HandshakeOutcome {
        loop {
            match &mut self.state {
                State::Accepting(acceptor) => {
                    match acceptor.read_tls(&mut self.sock) {
                        Ok(0) => return HandshakeOutcome::Fatal(reason::HANDSHAKE_EOF),
                        Ok(_) => {}
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            debug!("tls accept read failed: {err}");
                            return HandshakeOutcome::Fatal(reason::HANDSHAKE_ERROR);
                        }
                    }
                    match acceptor.accept() {
                        Ok(None) => return HandshakeOutcome::WantRead,
                        Ok(Some(accepted)) => {
                            let hello = accepted.client_hello();
                            let offers: Vec<Vec<u8>> = hello
                                .alpn()
                                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                                .unwrap_or_default();
                            let choice = self
                                .context
                                .select_alpn(offers.iter().map(Vec::as_slice));
                            if choice == context::AlpnChoice::NoOverlap
                                && self.context.is_strict()
                            {
                                trace!("alpn strict mismatch, aborting handshake");
                                self.state = State::Poisoned;
                                return HandshakeOutcome::Fatal(reason::ALPN_STRICT_MISMATCH);
                            }
                            let config = self.context.config_for(choice);
                            match accepted.into_connection(config) {
                                Ok(mut conn) => {
                                    conn.set_buffer_limit(Some(WRITE_BUFFER_LIMIT));
                                    self.state = State::Established(Box::new(conn));
                                }
                                Err((err, mut alert)) => {
                                    debug!("tls accept failed: {err}");
                                    let _ = alert.write(&mut self.sock);
                                    self.state = State::Poisoned;
                                    return HandshakeOutcome::Fatal(reason::SESSION_NEW_FAILED);
                                }
                            }
                        }
                        Err((err, mut alert)) => {
                            debug!("client hello rejected: {err}");
                            let _ = alert.write(&mut self.sock);
                            self.state = State::Poisoned;
                            return HandshakeOutcome::Fatal(reason::HANDSHAKE_ERROR);
                        }
                    }
                }
                State::Established(conn) => {
                    while conn.wants_write() {
                        match conn.write_tls(&mut self.sock) {
                            Ok(_) => {}
                            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                                return HandshakeOutcome::WantWrite;
                            }
                            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                            Err(err) => {
                                debug!("tls handshake write failed: {err}");
                                return HandshakeOutcome::Fatal(reason::HANDSHAKE_ERROR);
                            }
                        }
                    }
                    if !conn.is_handshaking() {
                        return HandshakeOutcome::Done(session_info(conn));
                    }
                    match conn.read_tls(&mut self.sock) {
                        Ok(0) => return HandshakeOutcome::Fatal(reason::HANDSHAKE_EOF),
                        Ok(_) => {
                            if let Err(err) = conn.process_new_packets() {
                                debug!("tls handshake failed: {err}");
                                // flush the alert rustls queued for the peer
                                while conn.wants_write() {
                                    if conn.write_tls(&mut self.sock).is_err() {
                                        break;
                                    }
                                }
                                return HandshakeOutcome::Fatal(reason::HANDSHAKE_ERROR);
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return HandshakeOutcome::WantRead;
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            debug!("tls handshake read failed: {err}");
                            return HandshakeOutcome::Fatal(reason::HANDSHAKE_ERROR);
                        }
                    }
                }
                #[cfg(target_os = "linux")]
                State::Kernel => return HandshakeOutcome::Done(TlsInfo::default()),
                State::Poisoned => return HandshakeOutcome::Fatal(reason::HANDSHAKE_ERROR),
            }
        }
    }

    pub fn peer_presented_cert(&self) -> bool {
        match &self.state {
            State::Established(conn) => conn
                .peer_certificates()
                .is_some_and(|certs| !certs.is_empty()),
            _ => false,
        }
    }

    /// Try to hand record processing to the kernel. Any plaintext the
    /// connection already decrypted is drained into `pending_plain` first.
    #[cfg(target_os = "linux")]
    pub fn try_ktls_offload(&mut self, pending_plain: &mut ByteBuf64) -> KtlsOffload {
        if self.context.ktls() == KtlsMode::Disabled {
            return KtlsOffload::NotAttempted;
        }
        let State::Established(conn) = &mut self.state else {
            return KtlsOffload::NotAttempted;
        };
        if conn.is_handshaking() || conn.wants_write() {
            return KtlsOffload::Fallback("handshake state not quiescent");
        }
        let version = conn.protocol_version();
        let suite = conn
            .negotiated_cipher_suite()
            .map(|suite| context::suite_name(&suite))
            .unwrap_or_default();
        if !ktls::cipher_supported(version, &suite) {
            return KtlsOffload::Fallback("cipher not kernel-supported");
        }
        let Some(version) = version else {
            return KtlsOffload::Fallback("no negotiated version");
        };

        // the ULP attach is the last failure point that leaves the
        // user-space connection usable
        if let Err(err) = ktls::attach_ulp(self.sock.as_raw_fd()) {
            debug!("ktls ulp attach failed: {err}");
            return KtlsOffload::Fallback("tcp ulp attach failed");
        }

        // drain plaintext rustls already decrypted (e.g. early request
        // bytes sent right behind the client Finished)
        let mut scratch = [0u8; 4096];
        loop {
            match conn.reader().read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => {
                    if pending_plain.append(&scratch[..n]).is_err() {
                        return KtlsOffload::Fallback("buffer growth failed");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }

        let state = std::mem::replace(&mut self.state, State::Poisoned);
        let State::Established(conn) = state else {
            unreachable!("established state checked above");
        };
        match conn.dangerous_extract_secrets() {
            Ok(secrets) => {
                match ktls::install_secrets(self.sock.as_raw_fd(), version, secrets) {
                    Ok(()) => {
                        self.state = State::Kernel;
                        KtlsOffload::Enabled
                    }
                    Err(err) => {
                        debug!("ktls secret install failed: {err}");
                        KtlsOffload::FatalAfterExtract
                    }
                }
            }
            Err(err) => {
                debug!("ktls secret extraction failed: {err}");
                KtlsOffload::FatalAfterExtract
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn try_ktls_offload(&mut self, _pending_plain: &mut ByteBuf64) -> KtlsOffload {
        KtlsOffload::NotAttempted
    }

    pub fn read(&mut self, out: &mut ByteBuf64, chunk: usize) -> TransportResult {
        match &mut self.state {
            State::Established(conn) => {
                let mut sock_eof = false;
                loop {
                    match conn.read_tls(&mut self.sock) {
                        Ok(0) => {
                            sock_eof = true;
                            break;
                        }
                        Ok(_) => {
                            if conn.process_new_packets().is_err() {
                                // flush any alert then fail
                                while conn.wants_write() {
                                    if conn.write_tls(&mut self.sock).is_err() {
                                        break;
                                    }
                                }
                                return TransportResult::blocked(TransportHint::Error);
                            }
                            break;
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(_) => return TransportResult::blocked(TransportHint::Error),
                    }
                }

                let mut total = 0;
                let mut scratch = [0u8; 16 * 1024];
                loop {
                    let want = chunk.min(scratch.len());
                    match conn.reader().read(&mut scratch[..want]) {
                        Ok(0) => {
                            // close_notify
                            return TransportResult::progress(total);
                        }
                        Ok(n) => {
                            if out.append(&scratch[..n]).is_err() {
                                return TransportResult::blocked(TransportHint::Error);
                            }
                            total += n;
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                            // tcp eof without close_notify; treat as close
                            return TransportResult::progress(total);
                        }
                        Err(_) => return TransportResult::blocked(TransportHint::Error),
                    }
                }

                if total > 0 {
                    TransportResult::progress(total)
                } else if sock_eof {
                    TransportResult::progress(0)
                } else {
                    TransportResult::blocked(TransportHint::ReadReady)
                }
            }
            #[cfg(target_os = "linux")]
            State::Kernel => {
                let mut scratch = [0u8; 16 * 1024];
                let want = chunk.min(scratch.len());
                loop {
                    match self.sock.read(&mut scratch[..want]) {
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
                        // a non-data record surfaced mid-stream; nothing
                        // sensible can be done in-kernel
                        Err(_) => return TransportResult::blocked(TransportHint::Error),
                    }
                }
            }
            _ => TransportResult::blocked(TransportHint::Error),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> TransportResult {
        match &mut self.state {
            State::Established(conn) => {
                let written = match conn.writer().write(data) {
                    Ok(n) => n,
                    Err(_) => return TransportResult::blocked(TransportHint::Error),
                };
                while conn.wants_write() {
                    match conn.write_tls(&mut self.sock) {
                        Ok(_) => {}
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return TransportResult {
                                bytes: written,
                                hint: TransportHint::WriteReady,
                            };
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => return TransportResult::blocked(TransportHint::Error),
                    }
                }
                if written < data.len() {
                    // buffer limit reached; more room once records flush
                    TransportResult {
                        bytes: written,
                        hint: TransportHint::WriteReady,
                    }
                } else {
                    TransportResult::progress(written)
                }
            }
            #[cfg(target_os = "linux")]
            State::Kernel => loop {
                match self.sock.write(data) {
                    Ok(n) => return TransportResult::progress(n),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return TransportResult::blocked(TransportHint::WriteReady);
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return TransportResult::blocked(TransportHint::Error),
                }
            },
            _ => TransportResult::blocked(TransportHint::Error),
        }
    }

    /// Send close_notify once and give the record one chance (plus one
    /// follow-up) to reach the wire. Never blocks.
    pub fn shutdown(&mut self) {
        if let State::Established(conn) = &mut self.state {
            if !self.sent_close_notify {
                self.sent_close_notify = true;
                conn.send_close_notify();
            }
            for _ in 0..2 {
                if !conn.wants_write() {
                    break;
                }
                if conn.write_tls(&mut self.sock).is_err() {
                    break;
                }
            }
        }
    }
}

fn session_info(conn: &ServerConnection) -> TlsInfo {
    let alpn = conn
        .alpn_protocol()
        .map(|protocol| String::from_utf8_lossy(protocol).into_owned())
        .unwrap_or_default();
    let cipher = conn
        .negotiated_cipher_suite()
        .map(|suite| context::suite_name(&suite))
        .unwrap_or_default();
    let version = conn
        .protocol_version()
        .map(context::version_label)
        .unwrap_or_default();
    let subject = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(context::peer_subject)
        .unwrap_or_default();
    TlsInfo::new(&alpn, &cipher, &version, &subject)
}

impl std::fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Accepting(_) => "accepting",
            State::Established(_) => "established",
            #[cfg(target_os = "linux")]
            State::Kernel => "kernel",
            State::Poisoned => "poisoned",
        };
        f.debug_struct("TlsStream").field("state", &state).finish()
    }
}
