//! Request decompression and response compression codecs.
//!
//! Which codings exist depends on the compiled feature set; a coding that
//! is not compiled in is simply not recognized, leaving the body untouched
//! (requests) or unselected (responses).

use std::io::Read;

use http::HeaderValue;

use crate::buf::ByteBuf64;
use crate::error::{Error, Parse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    Gzip,
    Deflate,
    #[cfg(feature = "brotli")]
    Brotli,
    #[cfg(feature = "zstd")]
    Zstd,
}

impl Coding {
    #[must_use]
    pub fn from_token(token: &[u8]) -> Option<Self> {
        if token.eq_ignore_ascii_case(b"gzip") || token.eq_ignore_ascii_case(b"x-gzip") {
            Some(Self::Gzip)
        } else if token.eq_ignore_ascii_case(b"deflate") {
            Some(Self::Deflate)
        } else {
            #[cfg(feature = "brotli")]
            if token.eq_ignore_ascii_case(b"br") {
                return Some(Self::Brotli);
            }
            #[cfg(feature = "zstd")]
            if token.eq_ignore_ascii_case(b"zstd") {
                return Some(Self::Zstd);
            }
            None
        }
    }

    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            #[cfg(feature = "brotli")]
            Self::Brotli => "br",
            #[cfg(feature = "zstd")]
            Self::Zstd => "zstd",
        }
    }
}

/// First coding in the client's `Accept-Encoding` preference order that we
/// can produce.
#[must_use]
pub(crate) fn select_response_coding(accept_encoding: Option<&HeaderValue>) -> Option<Coding> {
    let value = accept_encoding?.as_bytes();
    for member in value.split(|byte| *byte == b',') {
        // drop parameters such as `;q=0.8`
        let token = member
            .split(|byte| *byte == b';')
            .next()
            .unwrap_or_default();
        let token = trim_ows(token);
        if token.is_empty() {
            continue;
        }
        if let Some(coding) = Coding::from_token(token) {
            return Some(coding);
        }
    }
    None
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let Some((b' ' | b'\t', rest)) = bytes.split_first() {
        bytes = rest;
    }
    while let Some((b' ' | b'\t', rest)) = bytes.split_last() {
        bytes = rest;
    }
    bytes
}

fn read_capped(mut reader: impl Read, max_bytes: u64, out: &mut ByteBuf64) -> Result<(), Error> {
    let mut plain = Vec::new();
    let mut limited = reader.by_ref().take(max_bytes + 1);
    limited
        .read_to_end(&mut plain)
        .map_err(|err| Error::new_parse(Parse::DecompressFailed).with(err))?;
    if plain.len() as u64 > max_bytes {
        return Err(Error::new_parse(Parse::BodyTooLarge));
    }
    out.append(&plain)
        .map_err(|_| Error::new_parse(Parse::BodyTooLarge))?;
    Ok(())
}

/// Inflate `input` into `out`, never producing more than `max_bytes`.
pub(crate) fn decompress(
    coding: Coding,
    input: &[u8],
    max_bytes: u64,
    out: &mut ByteBuf64,
) -> Result<(), Error> {
    match coding {
        Coding::Gzip => read_capped(flate2::bufread::GzDecoder::new(input), max_bytes, out),
        Coding::Deflate => read_capped(flate2::bufread::ZlibDecoder::new(input), max_bytes, out),
        #[cfg(feature = "brotli")]
        Coding::Brotli => read_capped(brotli::Decompressor::new(input, 4096), max_bytes, out),
        #[cfg(feature = "zstd")]
        Coding::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(input)
                .map_err(|err| Error::new_parse(Parse::DecompressFailed).with(err))?;
            read_capped(decoder, max_bytes, out)
        }
    }
}

/// Compress `input` with `coding` at the default level.
pub(crate) fn compress(coding: Coding, input: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Write;

    match coding {
        Coding::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(input)?;
            encoder.finish()
        }
        Coding::Deflate => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(input)?;
            encoder.finish()
        }
        #[cfg(feature = "brotli")]
        Coding::Brotli => {
            let mut output = Vec::new();
            let params = brotli::enc::BrotliEncoderParams::default();
            brotli::BrotliCompress(&mut std::io::Cursor::new(input), &mut output, &params)?;
            Ok(output)
        }
        #[cfg(feature = "zstd")]
        Coding::Zstd => zstd::stream::encode_all(std::io::Cursor::new(input), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gzip_bytes(input: &[u8]) -> Vec<u8> {
        compress(Coding::Gzip, input).unwrap()
    }

    #[test]
    fn gzip_round_trip() {
        let packed = gzip_bytes(b"hello petrel");
        let mut out = ByteBuf64::new();
        decompress(Coding::Gzip, &packed, 1 << 20, &mut out).unwrap();
        assert_eq!(out.as_slice(), b"hello petrel");
    }

    #[test]
    fn deflate_round_trip() {
        let packed = compress(Coding::Deflate, b"zlib framed").unwrap();
        let mut out = ByteBuf64::new();
        decompress(Coding::Deflate, &packed, 1 << 20, &mut out).unwrap();
        assert_eq!(out.as_slice(), b"zlib framed");
    }

    #[test]
    fn bomb_is_bounded() {
        // 1 MiB of zeros compresses to almost nothing
        let packed = gzip_bytes(&vec![0u8; 1 << 20]);
        assert!(packed.len() < 4096);
        let mut out = ByteBuf64::new();
        let err = decompress(Coding::Gzip, &packed, 1024, &mut out).unwrap_err();
        assert_eq!(err.parse_kind(), Some(Parse::BodyTooLarge));
    }

    #[test]
    fn garbage_input_fails_cleanly() {
        let mut out = ByteBuf64::new();
        let err = decompress(Coding::Gzip, b"not gzip at all", 1024, &mut out).unwrap_err();
        assert_eq!(err.parse_kind(), Some(Parse::DecompressFailed));
    }

    #[test]
    fn coding_selection_follows_client_order() {
        let value = HeaderValue::from_static("deflate, gzip;q=0.5");
        assert_eq!(select_response_coding(Some(&value)), Some(Coding::Deflate));

        let value = HeaderValue::from_static("unknown, gzip");
        assert_eq!(select_response_coding(Some(&value)), Some(Coding::Gzip));

        let value = HeaderValue::from_static("identity");
        assert_eq!(select_response_coding(Some(&value)), None);

        assert_eq!(select_response_coding(None), None);
    }

    #[test]
    fn token_lookup_is_case_insensitive() {
        assert_eq!(Coding::from_token(b"GZIP"), Some(Coding::Gzip));
        assert_eq!(Coding::from_token(b"x-gzip"), Some(Coding::Gzip));
        assert_eq!(Coding::from_token(b"nope"), None);
    }
}
