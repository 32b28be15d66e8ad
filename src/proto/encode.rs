//! Response head construction.
//!
//! Heads are rendered directly into the connection's outbound buffer with
//! capacity reserved up front from the sum of all known field sizes.

use http::{HeaderName, HeaderValue, StatusCode, Version};

use crate::buf::{ByteBuf64, CapacityOverflow};
use crate::proto::date;

/// Preformatted interim response for `Expect: 100-continue`.
pub(crate) const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

const CRLF: &[u8] = b"\r\n";
const SEP: &[u8] = b": ";
const DATE_FIELD: &[u8] = b"Date: ";
const CONTENT_TYPE_FIELD: &[u8] = b"Content-Type: ";
const CONTENT_LENGTH_FIELD: &[u8] = b"Content-Length: ";
const CONTENT_ENCODING_FIELD: &[u8] = b"Content-Encoding: ";
const TRANSFER_ENCODING_CHUNKED: &[u8] = b"Transfer-Encoding: chunked";
const CONNECTION_FIELD: &[u8] = b"Connection: ";
const KEEP_ALIVE: &[u8] = b"keep-alive";
const CLOSE: &[u8] = b"close";

pub(crate) struct HeadFields<'a> {
    pub version: Version,
    pub status: StatusCode,
    pub reason: Option<&'a str>,
    pub content_type: &'a str,
    pub content_encoding: Option<&'a [u8]>,
    /// `None` selects `Transfer-Encoding: chunked`.
    pub body_len: Option<u64>,
    pub keep_alive: bool,
    pub extra: &'a [(HeaderName, HeaderValue)],
}

fn version_str(version: Version) -> &'static [u8] {
    if version == Version::HTTP_10 {
        b"HTTP/1.0"
    } else {
        b"HTTP/1.1"
    }
}

fn reason_for<'a>(status: StatusCode, reason: Option<&'a str>) -> &'a str {
    match reason {
        Some(reason) if !reason.is_empty() => reason,
        _ => status.canonical_reason().unwrap_or("Unknown"),
    }
}

/// Render a full response head, terminating CRLFCRLF included.
pub(crate) fn build_head(
    fields: &HeadFields<'_>,
    out: &mut ByteBuf64,
) -> Result<(), CapacityOverflow> {
    date::update();

    let reason = reason_for(fields.status, fields.reason);
    let connection = if fields.keep_alive { KEEP_ALIVE } else { CLOSE };

    let mut len_buf = itoa::Buffer::new();
    let body_len: Option<&[u8]> = match fields.body_len {
        Some(len) => Some(len_buf.format(len).as_bytes()),
        None => None,
    };

    let mut total = 8 + 1 + 3 + 1 + reason.len() + CRLF.len();
    total += DATE_FIELD.len() + date::DATE_VALUE_LENGTH + CRLF.len();
    total += CONTENT_TYPE_FIELD.len() + fields.content_type.len() + CRLF.len();
    if let Some(encoding) = fields.content_encoding {
        total += CONTENT_ENCODING_FIELD.len() + encoding.len() + CRLF.len();
    }
    total += match body_len {
        Some(digits) => CONTENT_LENGTH_FIELD.len() + digits.len() + CRLF.len(),
        None => TRANSFER_ENCODING_CHUNKED.len() + CRLF.len(),
    };
    total += CONNECTION_FIELD.len() + connection.len() + CRLF.len();
    for (name, value) in fields.extra {
        total += name.as_str().len() + SEP.len() + value.as_bytes().len() + CRLF.len();
    }
    total += CRLF.len();

    out.ensure_available(total)?;

    out.unchecked_append(version_str(fields.version));
    out.unchecked_push(b' ');
    out.unchecked_append(fields.status.as_str().as_bytes());
    out.unchecked_push(b' ');
    out.unchecked_append(reason.as_bytes());
    out.unchecked_append(CRLF);

    out.unchecked_append(DATE_FIELD);
    date::unchecked_extend(out);
    out.unchecked_append(CRLF);

    out.unchecked_append(CONTENT_TYPE_FIELD);
    out.unchecked_append(fields.content_type.as_bytes());
    out.unchecked_append(CRLF);

    if let Some(encoding) = fields.content_encoding {
        out.unchecked_append(CONTENT_ENCODING_FIELD);
        out.unchecked_append(encoding);
        out.unchecked_append(CRLF);
    }

    match body_len {
        Some(digits) => {
            out.unchecked_append(CONTENT_LENGTH_FIELD);
            out.unchecked_append(digits);
            out.unchecked_append(CRLF);
        }
        None => {
            out.unchecked_append(TRANSFER_ENCODING_CHUNKED);
            out.unchecked_append(CRLF);
        }
    }

    out.unchecked_append(CONNECTION_FIELD);
    out.unchecked_append(connection);
    out.unchecked_append(CRLF);

    for (name, value) in fields.extra {
        out.unchecked_append(name.as_str().as_bytes());
        out.unchecked_append(SEP);
        out.unchecked_append(value.as_bytes());
        out.unchecked_append(CRLF);
    }

    out.unchecked_append(CRLF);
    Ok(())
}

/// Minimal error response: status line, Date, Content-Length: 0,
/// Connection. No body.
pub(crate) fn build_error_head(
    status: StatusCode,
    keep_alive: bool,
    out: &mut ByteBuf64,
) -> Result<(), CapacityOverflow> {
    date::update();

    let reason = reason_for(status, None);
    let connection = if keep_alive { KEEP_ALIVE } else { CLOSE };

    let total = 8
        + 1
        + 3
        + 1
        + reason.len()
        + CRLF.len()
        + DATE_FIELD.len()
        + date::DATE_VALUE_LENGTH
        + CRLF.len()
        + CONTENT_LENGTH_FIELD.len()
        + 1
        + CRLF.len()
        + CONNECTION_FIELD.len()
        + connection.len()
        + CRLF.len()
        + CRLF.len();

    out.ensure_available(total)?;

    out.unchecked_append(b"HTTP/1.1 ");
    out.unchecked_append(status.as_str().as_bytes());
    out.unchecked_push(b' ');
    out.unchecked_append(reason.as_bytes());
    out.unchecked_append(CRLF);
    out.unchecked_append(DATE_FIELD);
    date::unchecked_extend(out);
    out.unchecked_append(CRLF);
    out.unchecked_append(CONTENT_LENGTH_FIELD);
    out.unchecked_push(b'0');
    out.unchecked_append(CRLF);
    out.unchecked_append(CONNECTION_FIELD);
    out.unchecked_append(connection);
    out.unchecked_append(CRLF);
    out.unchecked_append(CRLF);
    Ok(())
}
