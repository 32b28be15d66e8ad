//! HTTP/1.x request head parsing.
//!
//! `httparse` does the line/token work; the policy layer on top enforces
//! the engine's framing rules: the nine known methods, HTTP/1.0 and /1.1
//! only, no obsolete folding, consistent Content-Length versus
//! Transfer-Encoding, bounded header size.

use std::mem::MaybeUninit;

use http::{HeaderMap, HeaderName, HeaderValue, Method, Version, header};
use tracing::debug;

use crate::error::{Error, Parse};
use crate::method;

pub(crate) const DEFAULT_MAX_HEADERS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub path: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub keep_alive: bool,
    pub expect_continue: bool,
    pub framing: BodyFraming,
}

/// Parse one request head from `buf`.
///
/// Returns `Ok(None)` when the head is still incomplete, otherwise the head
/// and the number of bytes it consumed.
pub(crate) fn parse_head(
    buf: &[u8],
    max_header_bytes: usize,
) -> Result<Option<(RequestHead, usize)>, Error> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut headers: [MaybeUninit<httparse::Header<'_>>; DEFAULT_MAX_HEADERS] =
        [const { MaybeUninit::uninit() }; DEFAULT_MAX_HEADERS];
    let mut req = httparse::Request::new(&mut []);

    let head_len = match req.parse_with_uninit_headers(buf, &mut headers) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() > max_header_bytes {
                return Err(Error::new_parse(Parse::HeadersTooLarge));
            }
            return Ok(None);
        }
        Err(err) => {
            debug!("request head rejected: {err}");
            return Err(Error::new_parse(match err {
                httparse::Error::Version => Parse::VersionUnsupported,
                httparse::Error::TooManyHeaders => Parse::HeadersTooLarge,
                _ => Parse::Malformed,
            }));
        }
    };

    if head_len > max_header_bytes {
        return Err(Error::new_parse(Parse::HeadersTooLarge));
    }

    // httparse only produced Complete with these set
    let method_token = req.method.unwrap_or_default();
    let method = method::method_from_token(method_token.as_bytes())
        .ok_or_else(|| Error::new_parse(Parse::MethodUnknown))?;
    let path = req.path.unwrap_or_default().to_owned();
    let is_http_11 = req.version == Some(1);
    let version = if is_http_11 {
        Version::HTTP_11
    } else {
        Version::HTTP_10
    };

    // HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close.
    let mut keep_alive = is_http_11;
    let mut expect_continue = false;
    let mut content_length: Option<u64> = None;
    let mut te_chunked = false;

    let mut header_map = HeaderMap::with_capacity(req.headers.len());
    for raw in req.headers.iter() {
        let name = HeaderName::from_bytes(raw.name.as_bytes())
            .map_err(|_| Error::new_parse(Parse::Malformed))?;
        let value = HeaderValue::from_bytes(raw.value)
            .map_err(|_| Error::new_parse(Parse::Malformed))?;

        if name == header::TRANSFER_ENCODING {
            if !is_http_11 {
                debug!("Transfer-Encoding on HTTP/1.0 request");
                return Err(Error::new_parse(Parse::FramingInvalid));
            }
            for coding in split_list(raw.value) {
                if coding.eq_ignore_ascii_case(b"chunked") {
                    te_chunked = true;
                } else {
                    debug!(
                        "unsupported transfer-coding: {:?}",
                        String::from_utf8_lossy(coding)
                    );
                    return Err(Error::new_parse(Parse::TransferEncodingUnknown));
                }
            }
        } else if name == header::CONTENT_LENGTH {
            let len = content_length_parse(raw.value)
                .ok_or_else(|| Error::new_parse(Parse::FramingInvalid))?;
            if let Some(prev) = content_length {
                if prev != len {
                    debug!("conflicting Content-Length values: {prev} vs {len}");
                    return Err(Error::new_parse(Parse::FramingInvalid));
                }
            }
            content_length = Some(len);
        } else if name == header::CONNECTION {
            for token in split_list(raw.value) {
                if token.eq_ignore_ascii_case(b"close") {
                    keep_alive = false;
                } else if token.eq_ignore_ascii_case(b"keep-alive") && !is_http_11 {
                    keep_alive = true;
                }
            }
        } else if name == header::EXPECT {
            expect_continue = raw.value.eq_ignore_ascii_case(b"100-continue");
        }

        header_map.append(name, value);
    }

    let framing = if te_chunked {
        if content_length.is_some() {
            debug!("both Content-Length and Transfer-Encoding: chunked present");
            return Err(Error::new_parse(Parse::FramingInvalid));
        }
        BodyFraming::Chunked
    } else {
        match content_length {
            Some(0) | None => BodyFraming::None,
            Some(len) => BodyFraming::Length(len),
        }
    };

    Ok(Some((
        RequestHead {
            method,
            path,
            version,
            headers: header_map,
            keep_alive,
            expect_continue,
            framing,
        },
        head_len,
    )))
}

/// Strict digits-only Content-Length value.
pub(crate) fn content_length_parse(value: &[u8]) -> Option<u64> {
    if value.is_empty() || value.len() > 19 {
        return None;
    }
    let mut len = 0u64;
    for byte in value {
        if !byte.is_ascii_digit() {
            return None;
        }
        len = len * 10 + u64::from(byte - b'0');
    }
    Some(len)
}

/// Comma-separated list members with surrounding whitespace trimmed;
/// empty members are skipped.
fn split_list(value: &[u8]) -> impl Iterator<Item = &[u8]> {
    value
        .split(|byte| *byte == b',')
        .map(|part| trim_ows(part))
        .filter(|part| !part.is_empty())
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
