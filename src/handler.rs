//! Handler shapes: synchronous, asynchronous and streaming.

use std::future::Future;
use std::pin::Pin;

use http::{StatusCode, Version};

use crate::buf::ByteBuf64;
use crate::proto::{chunked, encode};
use crate::request::Request;
use crate::response::Response;

/// Future returned by an asynchronous handler. Polled on the loop thread;
/// `Send` because the server object itself may move onto that thread.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

pub enum Handler {
    /// Runs to completion inside the loop iteration.
    Sync(Box<dyn Fn(&Request) -> Response + Send + Sync>),
    /// May suspend; the reactor resumes it when its waker fires. While it
    /// is in flight no further requests are parsed on the connection.
    Async(Box<dyn Fn(Request) -> HandlerFuture + Send + Sync>),
    /// Emits status + headers, then body chunks, then end.
    Streaming(Box<dyn Fn(&Request, &mut ResponseStream<'_>) + Send + Sync>),
}

impl Handler {
    pub fn sync(f: impl Fn(&Request) -> Response + Send + Sync + 'static) -> Self {
        Self::Sync(Box::new(f))
    }

    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        Self::Async(Box::new(move |req| Box::pin(f(req))))
    }

    pub fn streaming(f: impl Fn(&Request, &mut ResponseStream<'_>) + Send + Sync + 'static) -> Self {
        Self::Streaming(Box::new(f))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sync(_) => "Handler::Sync",
            Self::Async(_) => "Handler::Async",
            Self::Streaming(_) => "Handler::Streaming",
        })
    }
}

/// Incremental response writer handed to streaming handlers.
///
/// The head goes out first; when no content length is announced the body is
/// chunk-encoded and terminated by [`ResponseStream::end`]. For HEAD
/// requests body bytes are suppressed while headers stay intact.
pub struct ResponseStream<'a> {
    out: &'a mut ByteBuf64,
    version: Version,
    keep_alive: bool,
    suppress_body: bool,
    chunked: bool,
    head_sent: bool,
    ended: bool,
    failed: bool,
}

impl<'a> ResponseStream<'a> {
    pub(crate) fn new(
        out: &'a mut ByteBuf64,
        version: Version,
        keep_alive: bool,
        suppress_body: bool,
    ) -> Self {
        Self {
            out,
            version,
            keep_alive,
            suppress_body,
            chunked: false,
            head_sent: false,
            ended: false,
            failed: false,
        }
    }

    /// Emit the response head. `content_length` of `None` switches the body
    /// to chunked encoding.
    pub fn send_head(
        &mut self,
        status: StatusCode,
        content_type: &str,
        content_length: Option<u64>,
    ) {
        if self.head_sent {
            return;
        }
        self.head_sent = true;
        self.chunked = content_length.is_none();
        let fields = encode::HeadFields {
            version: self.version,
            status,
            reason: None,
            content_type,
            content_encoding: None,
            body_len: content_length,
            keep_alive: self.keep_alive,
            extra: &[],
        };
        if encode::build_head(&fields, self.out).is_err() {
            self.failed = true;
        }
    }

    /// Append one body chunk. A head without explicit length must have been
    /// sent first; chunks after [`Self::end`] are dropped.
    pub fn write_chunk(&mut self, data: &[u8]) {
        if !self.head_sent || self.ended || data.is_empty() {
            return;
        }
        if self.suppress_body {
            return;
        }
        let result = if self.chunked {
            chunked::encode_chunk(data, self.out)
        } else {
            self.out.append(data)
        };
        if result.is_err() {
            self.failed = true;
        }
    }

    /// Finish the body. Mandatory for chunked responses.
    pub fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        if self.chunked && !self.suppress_body && chunked::encode_final(self.out).is_err() {
            self.failed = true;
        }
    }

    pub(crate) fn head_sent(&self) -> bool {
        self.head_sent
    }

    pub(crate) fn finished_cleanly(&self) -> bool {
        self.head_sent && self.ended && !self.failed
    }
}
