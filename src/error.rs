//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

/// Type-erased error, used at API boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Result type often returned from methods that can have petrel `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors that can occur while configuring or running a server.
///
/// The `Display` implementation only prints this level of error; sources are
/// exposed through `Error::source()` as erased types and must not be
/// depended on.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<BoxError>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Invalid configuration; surfaces synchronously from constructors.
    Config,
    /// An `io::Error` while binding, polling or moving bytes.
    Io,
    /// TLS context construction or handshake-layer failure.
    #[cfg(feature = "tls")]
    Tls,
    /// Malformed or unacceptable request input.
    Parse(Parse),
}

/// Client-input rejection, each mapping onto the minimal HTTP error
/// response emitted before the connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Parse {
    /// Missing or malformed request line / header token.
    Malformed,
    /// Method token did not match one of the nine supported methods.
    MethodUnknown,
    /// Version other than HTTP/1.0 or HTTP/1.1 on the plain h1 path.
    VersionUnsupported,
    /// Header folding (obs-fold) is rejected.
    ObsFold,
    /// Conflicting or invalid Content-Length / Transfer-Encoding.
    FramingInvalid,
    /// A transfer-coding we do not implement.
    TransferEncodingUnknown,
    /// Accumulated header bytes exceeded `max_header_bytes`.
    HeadersTooLarge,
    /// Declared or decoded body exceeded `max_body_bytes` (or the
    /// decompression bound).
    BodyTooLarge,
    /// Invalid chunk framing while decoding a chunked body.
    ChunkInvalid,
    /// Request body failed to decompress.
    DecompressFailed,
}

impl Parse {
    pub(crate) fn status(self) -> StatusCode {
        match self {
            Self::Malformed
            | Self::ObsFold
            | Self::FramingInvalid
            | Self::ChunkInvalid
            | Self::DecompressFailed => StatusCode::BAD_REQUEST,
            Self::MethodUnknown | Self::TransferEncodingUnknown => StatusCode::NOT_IMPLEMENTED,
            Self::VersionUnsupported => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            Self::HeadersTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Self {
        Self {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with(mut self, cause: impl Into<BoxError>) -> Self {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_config(msg: impl Into<BoxError>) -> Self {
        Self::new(Kind::Config).with(msg)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Self {
        Self::new(Kind::Io).with(cause)
    }

    #[cfg(feature = "tls")]
    pub(crate) fn new_tls(cause: impl Into<BoxError>) -> Self {
        Self::new(Kind::Tls).with(cause)
    }

    pub(crate) fn new_parse(parse: Parse) -> Self {
        Self::new(Kind::Parse(parse))
    }

    /// Returns true if this was caused by unacceptable client input.
    #[must_use]
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true for configuration errors raised before the server ran.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, Kind::Config)
    }

    /// The HTTP status a parse rejection maps to, if this is one.
    #[must_use]
    pub fn response_status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Parse(parse) => Some(parse.status()),
            _ => None,
        }
    }

    pub(crate) fn parse_kind(&self) -> Option<Parse> {
        match self.inner.kind {
            Kind::Parse(parse) => Some(parse),
            _ => None,
        }
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Config => "invalid configuration",
            Kind::Io => "i/o error",
            #[cfg(feature = "tls")]
            Kind::Tls => "tls error",
            Kind::Parse(Parse::Malformed) => "invalid request",
            Kind::Parse(Parse::MethodUnknown) => "unknown request method",
            Kind::Parse(Parse::VersionUnsupported) => "unsupported http version",
            Kind::Parse(Parse::ObsFold) => "obsolete header folding",
            Kind::Parse(Parse::FramingInvalid) => "invalid message framing",
            Kind::Parse(Parse::TransferEncodingUnknown) => "unsupported transfer-coding",
            Kind::Parse(Parse::HeadersTooLarge) => "request headers too large",
            Kind::Parse(Parse::BodyTooLarge) => "request body too large",
            Kind::Parse(Parse::ChunkInvalid) => "invalid chunked encoding",
            Kind::Parse(Parse::DecompressFailed) => "request body decompression failed",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_tuple("petrel::Error");
        builder.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            builder.field(cause);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.cause {
            Some(ref cause) => write!(f, "{}: {cause}", self.description()),
            None => f.write_str(self.description()),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_mapping() {
        assert_eq!(Parse::Malformed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(Parse::MethodUnknown.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(
            Parse::VersionUnsupported.status(),
            StatusCode::HTTP_VERSION_NOT_SUPPORTED
        );
        assert_eq!(
            Parse::HeadersTooLarge.status(),
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
        );
        assert_eq!(Parse::BodyTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn display_includes_cause() {
        let err = Error::new_config("probe path must start with '/'");
        let rendered = err.to_string();
        assert!(rendered.contains("invalid configuration"));
        assert!(rendered.contains("probe path"));
    }
}
