//! permessage-deflate (RFC 7692): offer parsing, response building and the
//! per-message compress/decompress contract.
//!
//! Compression always runs with a full 32 KiB window (the pure-rust deflate
//! backend has no window-size knob); an offer that insists on a smaller
//! *server* window is therefore declined rather than half-honored. Client
//! windows of any negotiated size inflate fine with a full-size window.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::concat::JoinedList;
use crate::config::WsDeflateConfig;

/// Trailing bytes stripped after compression and re-appended before
/// decompression, per RFC 7692 §7.2.1/§7.2.2.
const DEFLATE_TAIL: &[u8] = &[0x00, 0x00, 0xff, 0xff];

const FULL_WINDOW_BITS: u8 = 15;

/// Parameters agreed during the upgrade handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateNegotiated {
    pub server_max_window_bits: u8,
    pub client_max_window_bits: u8,
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
}

#[derive(Debug, Default)]
struct Offer {
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    server_max_window_bits: Option<u8>,
    client_max_window_bits: Option<Option<u8>>,
}

fn parse_window_bits(value: Option<&str>) -> Option<u8> {
    let value = value?.trim().trim_matches('"');
    let bits: u8 = value.parse().ok()?;
    (8..=15).contains(&bits).then_some(bits)
}

fn parse_offer(offer: &str) -> Option<Offer> {
    let mut parsed = Offer::default();
    let mut params = offer.split(';').map(str::trim);
    if !params.next()?.eq_ignore_ascii_case("permessage-deflate") {
        return None;
    }
    for param in params {
        let (name, value) = match param.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value)),
            None => (param, None),
        };
        match name.to_ascii_lowercase().as_str() {
            "server_no_context_takeover" if value.is_none() => {
                parsed.server_no_context_takeover = true;
            }
            "client_no_context_takeover" if value.is_none() => {
                parsed.client_no_context_takeover = true;
            }
            "server_max_window_bits" => {
                parsed.server_max_window_bits = Some(parse_window_bits(value)?);
            }
            "client_max_window_bits" => {
                parsed.client_max_window_bits = Some(match value {
                    Some(_) => Some(parse_window_bits(value)?),
                    None => None,
                });
            }
            _ => return None,
        }
    }
    Some(parsed)
}

/// Negotiate against the client's `Sec-WebSocket-Extensions` value.
///
/// Offers are tried in client order; the first acceptable
/// permessage-deflate offer wins. `None` declines the extension.
#[must_use]
pub fn negotiate(extensions: &str, config: &WsDeflateConfig) -> Option<DeflateNegotiated> {
    if !config.enabled {
        return None;
    }
    for raw_offer in extensions.split(',') {
        let Some(offer) = parse_offer(raw_offer) else {
            continue;
        };
        // we only compress with a full-size window
        if offer.server_max_window_bits.is_some_and(|bits| bits < FULL_WINDOW_BITS) {
            continue;
        }
        let client_bits = match offer.client_max_window_bits {
            Some(Some(bits)) => bits.min(config.client_max_window_bits),
            // parameter without value: client accepts whatever we pick
            Some(None) => config.client_max_window_bits,
            None => FULL_WINDOW_BITS,
        };
        return Some(DeflateNegotiated {
            server_max_window_bits: FULL_WINDOW_BITS,
            client_max_window_bits: client_bits,
            server_no_context_takeover: offer.server_no_context_takeover
                || config.server_no_context_takeover,
            client_no_context_takeover: offer.client_no_context_takeover
                || config.client_no_context_takeover,
        });
    }
    None
}

/// Render the `Sec-WebSocket-Extensions` response value.
#[must_use]
pub fn response_value(negotiated: &DeflateNegotiated) -> String {
    let mut params = JoinedList::<';'>::new();
    params.push("permessage-deflate");
    if negotiated.server_no_context_takeover {
        params.push("server_no_context_takeover");
    }
    if negotiated.client_no_context_takeover {
        params.push("client_no_context_takeover");
    }
    if negotiated.client_max_window_bits < FULL_WINDOW_BITS {
        params.push(&format!(
            "client_max_window_bits={}",
            negotiated.client_max_window_bits
        ));
    }
    params.take()
}

/// Per-connection deflate state honoring the negotiated context-takeover
/// flags. Not thread-safe; owned by the connection.
pub struct DeflateContext {
    compress: Compress,
    decompress: Decompress,
    reset_compress: bool,
    reset_decompress: bool,
    min_compress_size: usize,
}

impl DeflateContext {
    #[must_use]
    pub fn new(negotiated: &DeflateNegotiated, config: &WsDeflateConfig) -> Self {
        Self {
            compress: Compress::new(Compression::new(config.compression_level), false),
            decompress: Decompress::new(false),
            reset_compress: negotiated.server_no_context_takeover,
            reset_decompress: negotiated.client_no_context_takeover,
            min_compress_size: config.min_compress_size,
        }
    }

    /// Messages below the configured threshold go out uncompressed.
    #[must_use]
    pub fn should_skip(&self, payload_len: usize) -> bool {
        payload_len < self.min_compress_size
    }

    /// Compress one message payload, appending to `out`. The RFC 7692 tail
    /// is stripped from the result.
    pub fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), flate2::CompressError> {
        let start = out.len();
        let mut consumed = 0usize;
        loop {
            out.reserve((input.len() / 2).max(512));
            let before_in = self.compress.total_in();
            self.compress
                .compress_vec(&input[consumed..], out, FlushCompress::Sync)?;
            consumed += (self.compress.total_in() - before_in) as usize;
            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
        }
        debug_assert!(out[start..].ends_with(DEFLATE_TAIL));
        out.truncate(out.len().saturating_sub(DEFLATE_TAIL.len()));

        if self.reset_compress {
            self.compress.reset();
        }
        Ok(())
    }

    /// Decompress one message payload (tail re-appended internally).
    /// Output is bounded by `max_len`; 0 means unbounded.
    pub fn decompress(
        &mut self,
        input: &[u8],
        max_len: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), DeflateError> {
        let start = out.len();
        let max = if max_len == 0 { usize::MAX } else { max_len };

        let mut full_input = Vec::with_capacity(input.len() + DEFLATE_TAIL.len());
        full_input.extend_from_slice(input);
        full_input.extend_from_slice(DEFLATE_TAIL);

        let mut consumed = 0usize;
        loop {
            out.reserve(1024);
            let before_in = self.decompress.total_in();
            self.decompress
                .decompress_vec(&full_input[consumed..], out, FlushDecompress::Sync)
                .map_err(|_| DeflateError::Malformed)?;
            consumed += (self.decompress.total_in() - before_in) as usize;
            if out.len() - start > max {
                return Err(DeflateError::TooLarge);
            }
            if consumed == full_input.len() && out.len() < out.capacity() {
                break;
            }
        }

        if self.reset_decompress {
            self.decompress.reset(false);
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeflateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateContext")
            .field("reset_compress", &self.reset_compress)
            .field("reset_decompress", &self.reset_decompress)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeflateError {
    Malformed,
    TooLarge,
}

impl std::fmt::Display for DeflateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Malformed => "malformed deflate payload",
            Self::TooLarge => "decompressed payload above limit",
        })
    }
}

impl std::error::Error for DeflateError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_config() -> WsDeflateConfig {
        WsDeflateConfig {
            enabled: true,
            ..WsDeflateConfig::default()
        }
    }

    #[test]
    fn plain_offer_negotiates_defaults() {
        let negotiated = negotiate("permessage-deflate", &enabled_config()).unwrap();
        assert_eq!(negotiated.server_max_window_bits, 15);
        assert_eq!(negotiated.client_max_window_bits, 15);
        assert!(!negotiated.server_no_context_takeover);
    }

    #[test]
    fn disabled_config_declines() {
        assert!(negotiate("permessage-deflate", &WsDeflateConfig::default()).is_none());
    }

    #[test]
    fn offer_flags_are_honored() {
        let negotiated = negotiate(
            "permessage-deflate; client_no_context_takeover; client_max_window_bits=10",
            &enabled_config(),
        )
        .unwrap();
        assert!(negotiated.client_no_context_takeover);
        assert_eq!(negotiated.client_max_window_bits, 10);
    }

    #[test]
    fn small_server_window_is_declined() {
        assert!(
            negotiate(
                "permessage-deflate; server_max_window_bits=9",
                &enabled_config()
            )
            .is_none()
        );
    }

    #[test]
    fn second_offer_can_win() {
        let negotiated = negotiate(
            "permessage-deflate; server_max_window_bits=9, permessage-deflate",
            &enabled_config(),
        )
        .unwrap();
        assert_eq!(negotiated.server_max_window_bits, 15);
    }

    #[test]
    fn unknown_parameter_invalidates_offer() {
        assert!(negotiate("permessage-deflate; mystery_param", &enabled_config()).is_none());
    }

    #[test]
    fn response_value_lists_negotiated_params() {
        let negotiated = DeflateNegotiated {
            server_max_window_bits: 15,
            client_max_window_bits: 10,
            server_no_context_takeover: true,
            client_no_context_takeover: false,
        };
        let value = response_value(&negotiated);
        assert!(value.starts_with("permessage-deflate"));
        assert!(value.contains("server_no_context_takeover"));
        assert!(value.contains("client_max_window_bits=10"));
        assert!(!value.contains("client_no_context_takeover"));
    }

    #[test]
    fn compress_decompress_round_trip() {
        let negotiated = negotiate("permessage-deflate", &enabled_config()).unwrap();
        let config = enabled_config();
        let mut server = DeflateContext::new(&negotiated, &config);

        let message = b"a message that repeats itself, repeats itself, repeats itself";
        let mut packed = Vec::new();
        server.compress(message, &mut packed).unwrap();
        assert!(packed.len() < message.len());

        // loop the payload back through our own inflater
        let mut unpacked = Vec::new();
        server.decompress(&packed, 0, &mut unpacked).unwrap();
        assert_eq!(unpacked, message);
    }

    #[test]
    fn context_takeover_carries_across_messages() {
        let negotiated = negotiate("permessage-deflate", &enabled_config()).unwrap();
        let config = enabled_config();
        let mut ctx = DeflateContext::new(&negotiated, &config);

        let message = vec![b'z'; 512];
        let mut first = Vec::new();
        ctx.compress(&message, &mut first).unwrap();
        let mut second = Vec::new();
        ctx.compress(&message, &mut second).unwrap();
        // the second message references the shared window
        assert!(second.len() <= first.len());

        let mut out = Vec::new();
        ctx.decompress(&first, 0, &mut out).unwrap();
        ctx.decompress(&second, 0, &mut out).unwrap();
        assert_eq!(out.len(), 1024);
    }

    #[test]
    fn decompression_bound_enforced() {
        let negotiated = negotiate("permessage-deflate", &enabled_config()).unwrap();
        let config = enabled_config();
        let mut ctx = DeflateContext::new(&negotiated, &config);

        let mut packed = Vec::new();
        ctx.compress(&vec![0u8; 64 * 1024], &mut packed).unwrap();

        let mut out = Vec::new();
        assert_eq!(
            ctx.decompress(&packed, 1024, &mut out),
            Err(DeflateError::TooLarge)
        );
    }

    #[test]
    fn min_compress_size_respected() {
        let negotiated = negotiate("permessage-deflate", &enabled_config()).unwrap();
        let config = enabled_config();
        let ctx = DeflateContext::new(&negotiated, &config);
        assert!(ctx.should_skip(8));
        assert!(!ctx.should_skip(4096));
    }
}
