//! HTTP/2 integration points.
//!
//! The frame codec and HPACK state live outside the engine, behind
//! [`Http2Engine`]/[`Http2Connection`]. The reactor owns the three entry
//! paths — cleartext prior-knowledge preface, `Upgrade: h2c`, and
//! ALPN-negotiated `h2` — and shuttles raw bytes between the socket and the
//! codec. Requests the codec materializes carry their stream id and are
//! dispatched through the same router and handlers as HTTP/1.x.

use crate::buf::{ByteBuf64, CapacityOverflow};
use crate::config::Http2Config;
use crate::error::BoxError;
use crate::request::Request;
use crate::response::Response;

/// The HTTP/2 connection preface (RFC 9113 §3.4).
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// ALPN protocol id for HTTP/2 over TLS.
pub const ALPN_H2: &str = "h2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrefaceMatch {
    /// Buffer starts with the full preface.
    Yes,
    /// Buffer is a strict prefix of the preface; read more first.
    NeedMore,
    No,
}

/// Sniff the prior-knowledge preface at the very start of a connection.
pub(crate) fn sniff_preface(buf: &[u8]) -> PrefaceMatch {
    if buf.len() >= PREFACE.len() {
        if buf.starts_with(PREFACE) {
            PrefaceMatch::Yes
        } else {
            PrefaceMatch::No
        }
    } else if PREFACE.starts_with(buf) {
        PrefaceMatch::NeedMore
    } else {
        PrefaceMatch::No
    }
}

/// Factory installed on the server; one codec connection per transport
/// connection.
pub trait Http2Engine: Send + Sync {
    fn new_connection(&self, config: &Http2Config) -> Box<dyn Http2Connection>;
}

/// One codec connection. The reactor feeds it raw bytes and writes whatever
/// it emits; requests come back materialized with their stream id.
pub trait Http2Connection: Send {
    /// Consume connection bytes (the preface included on the
    /// prior-knowledge path). Frames to send are appended to `out`.
    fn recv(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<Vec<Request>, BoxError>;

    /// Serialize a handler response onto `stream_id`.
    fn respond(
        &mut self,
        stream_id: u32,
        response: &Response,
        out: &mut Vec<u8>,
    ) -> Result<(), BoxError>;

    /// Adopt a request that arrived via `Upgrade: h2c`; it becomes stream 1
    /// and its response travels as HTTP/2.
    fn accept_upgrade(&mut self, request: Request, out: &mut Vec<u8>) -> Result<(), BoxError>;

    /// Emit a GOAWAY ahead of connection teardown.
    fn goaway(&mut self, out: &mut Vec<u8>);
}

/// The 101 response committing an `Upgrade: h2c` switch.
pub(crate) fn build_h2c_switch_response(out: &mut ByteBuf64) -> Result<(), CapacityOverflow> {
    out.append(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n")
}

/// Whether an HTTP/1.1 request asks for the h2c upgrade.
pub(crate) fn wants_h2c_upgrade(req: &Request) -> bool {
    let upgrade_token = req
        .header(http::header::UPGRADE.as_str())
        .is_some_and(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("h2c"))
        });
    upgrade_token && req.header("http2-settings").is_some()
}
