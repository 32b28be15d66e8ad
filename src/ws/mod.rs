//! WebSocket upgrade glue: handshake parsing and the response build.
//!
//! The frame codec itself is an external collaborator; the engine performs
//! the RFC 6455 handshake, negotiates permessage-deflate, then feeds raw
//! post-upgrade bytes through a [`WsEndpoint`].

pub mod deflate;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::{HeaderMap, Method, header};
use sha1::{Digest, Sha1};

use crate::buf::{ByteBuf64, CapacityOverflow};
use crate::config::WsDeflateConfig;
use crate::request::Request;

pub use deflate::{DeflateContext, DeflateNegotiated};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` for a client key: SHA-1 over key + GUID, base64.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// Everything negotiated during the upgrade.
#[derive(Debug)]
pub struct WsNegotiated {
    pub deflate: Option<DeflateNegotiated>,
}

/// Per-connection endpoint produced by the routed factory. The engine
/// pushes raw frame bytes in and writes whatever the endpoint emits back
/// out; the actual frame codec lives behind this trait.
pub trait WsEndpoint: Send {
    fn on_open(&mut self, _negotiated: &WsNegotiated) {}

    /// Raw bytes from the peer; append outbound bytes to `out`.
    fn on_bytes(&mut self, input: &[u8], out: &mut Vec<u8>) -> WsControl;

    fn on_close(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsControl {
    Continue,
    Close,
}

/// A validated upgrade request.
#[derive(Debug)]
pub(crate) struct WsHandshake {
    pub key: String,
    pub deflate: Option<DeflateNegotiated>,
}

fn connection_has_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Whether the request head asks for a WebSocket upgrade at all.
#[must_use]
pub(crate) fn is_upgrade_request(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::GET
        && connection_has_upgrade(headers)
        && headers
            .get(header::UPGRADE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// Validate the upgrade request and negotiate extensions.
///
/// `None` means the handshake is unacceptable (missing key or wrong
/// version) and the caller responds 400.
pub(crate) fn parse_handshake(req: &Request, config: &WsDeflateConfig) -> Option<WsHandshake> {
    let version_ok = req
        .header(header::SEC_WEBSOCKET_VERSION.as_str())
        .is_some_and(|value| value.trim() == "13");
    if !version_ok {
        return None;
    }
    let key = req.header(header::SEC_WEBSOCKET_KEY.as_str())?.trim();
    if key.is_empty() {
        return None;
    }
    let deflate = req
        .header(header::SEC_WEBSOCKET_EXTENSIONS.as_str())
        .and_then(|offer| deflate::negotiate(offer, config));
    Some(WsHandshake {
        key: key.to_owned(),
        deflate,
    })
}

/// Render the 101 Switching Protocols response.
pub(crate) fn build_upgrade_response(
    handshake: &WsHandshake,
    out: &mut ByteBuf64,
) -> Result<(), CapacityOverflow> {
    let accept = accept_key(&handshake.key);
    let extensions = handshake.deflate.as_ref().map(|negotiated| deflate::response_value(negotiated));

    let mut total = "HTTP/1.1 101 Switching Protocols\r\n".len()
        + "Upgrade: websocket\r\n".len()
        + "Connection: Upgrade\r\n".len()
        + "Sec-WebSocket-Accept: ".len()
        + accept.len()
        + 2
        + 2;
    if let Some(ext) = &extensions {
        total += "Sec-WebSocket-Extensions: ".len() + ext.len() + 2;
    }

    out.ensure_available(total)?;
    out.unchecked_append(b"HTTP/1.1 101 Switching Protocols\r\n");
    out.unchecked_append(b"Upgrade: websocket\r\n");
    out.unchecked_append(b"Connection: Upgrade\r\n");
    out.unchecked_append(b"Sec-WebSocket-Accept: ");
    out.unchecked_append(accept.as_bytes());
    out.unchecked_append(b"\r\n");
    if let Some(ext) = &extensions {
        out.unchecked_append(b"Sec-WebSocket-Extensions: ");
        out.unchecked_append(ext.as_bytes());
        out.unchecked_append(b"\r\n");
    }
    out.unchecked_append(b"\r\n");
    Ok(())
}
