//! The response descriptor produced by handlers.

use std::fmt;

use http::{HeaderName, HeaderValue, StatusCode};

use crate::fd::Fd;

/// A file region to transmit through the kernel file-send path.
#[derive(Debug)]
pub struct FileSlice {
    pub file: Fd,
    pub offset: u64,
    pub len: u64,
}

pub enum Body {
    Bytes(Vec<u8>),
    File(FileSlice),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::File(slice) => f.debug_tuple("File").field(slice).finish(),
        }
    }
}

/// Status, optional reason override, content type, body and extra headers.
///
/// When `reason` is left empty the writer falls back to the canonical
/// phrase for the status code.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    reason: Option<String>,
    content_type: String,
    content_encoding: Option<HeaderValue>,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Body,
}

impl Response {
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            content_type: String::from("text/plain"),
            content_encoding: None,
            headers: Vec::new(),
            body: Body::Bytes(Vec::new()),
        }
    }

    #[must_use]
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Body::Bytes(body.into());
        self
    }

    /// Append bytes to the (in-memory) body, switching away from a file
    /// body if one was set.
    pub fn append_body(&mut self, chunk: impl AsRef<[u8]>) {
        match &mut self.body {
            Body::Bytes(bytes) => bytes.extend_from_slice(chunk.as_ref()),
            Body::File(_) => {
                self.body = Body::Bytes(chunk.as_ref().to_vec());
            }
        }
    }

    /// Serve `len` bytes of `file` starting at `offset` through the
    /// kernel file-send path.
    #[must_use]
    pub fn with_file(mut self, file: impl Into<Fd>, offset: u64, len: u64) -> Self {
        self.body = Body::File(FileSlice {
            file: file.into(),
            offset,
            len,
        });
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        if name == http::header::CONTENT_ENCODING {
            self.content_encoding = Some(value);
        } else {
            self.headers.push((name, value));
        }
        self
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[must_use]
    pub fn content_encoding(&self) -> Option<&HeaderValue> {
        self.content_encoding.as_ref()
    }

    #[must_use]
    pub fn headers(&self) -> &[(HeaderName, HeaderValue)] {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }

    pub(crate) fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Advertised body length: bytes length or the file slice length.
    #[must_use]
    pub fn body_len(&self) -> u64 {
        match &self.body {
            Body::Bytes(bytes) => bytes.len() as u64,
            Body::File(slice) => slice.len,
        }
    }

    pub(crate) fn take_body(&mut self) -> Body {
        std::mem::replace(&mut self.body, Body::Bytes(Vec::new()))
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::ok()
    }
}
