//! The request handed to handlers.

use bytes::Bytes;
use http::{HeaderMap, Method, Version, header::HeaderName};

use crate::tls::info::TlsInfo;

/// One parsed request: head, assembled (possibly decompressed) body,
/// optional chunked trailers, and — when applicable — negotiated TLS
/// parameters and the HTTP/2 stream it arrived on.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    trailers: Option<HeaderMap>,
    tls: Option<TlsInfo>,
    stream_id: Option<u32>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Method,
        path: String,
        version: Version,
        headers: HeaderMap,
        body: Bytes,
        trailers: Option<HeaderMap>,
        tls: Option<TlsInfo>,
        stream_id: Option<u32>,
    ) -> Self {
        Self {
            method,
            path,
            version,
            headers,
            body,
            trailers,
            tls,
            stream_id,
        }
    }

    /// Build a request materialized from an HTTP/2 stream by an external
    /// frame codec. The reactor attaches connection-level TLS info before
    /// dispatch.
    #[must_use]
    pub fn from_h2_stream(
        method: Method,
        path: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
        stream_id: u32,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            version: Version::HTTP_2,
            headers,
            body,
            trailers: None,
            tls: None,
            stream_id: Some(stream_id),
        }
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name` as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = HeaderName::from_bytes(name.as_ref().as_bytes()).ok()?;
        self.headers.get(&name)?.to_str().ok()
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn body_bytes(&self) -> Bytes {
        self.body.clone()
    }

    /// Trailing headers of a chunked body.
    #[must_use]
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// Negotiated TLS parameters, `None` on plain connections.
    #[must_use]
    pub fn tls_info(&self) -> Option<&TlsInfo> {
        self.tls.as_ref()
    }

    /// Negotiated ALPN protocol, `None` when not negotiated.
    #[must_use]
    pub fn alpn_protocol(&self) -> Option<&str> {
        self.tls
            .as_ref()
            .map(TlsInfo::alpn_protocol)
            .filter(|alpn| !alpn.is_empty())
    }

    /// HTTP/2 stream this request was materialized from.
    #[must_use]
    pub fn stream_id(&self) -> Option<u32> {
        self.stream_id
    }

    pub(crate) fn set_tls_info(&mut self, tls: Option<TlsInfo>) {
        self.tls = tls;
    }
}
