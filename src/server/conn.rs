//! Per-connection state: buffers, transport, timestamps, close mode, the
//! in-flight request decoder and async-handler slot.

use std::time::Instant;

use http::{HeaderValue, Version};

use crate::buf::ByteBuf64;
use crate::fd::Fd;
use crate::h2::Http2Connection;
use crate::handler::HandlerFuture;
use crate::proto::decode::BodyDecoder;
use crate::proto::parse::RequestHead;
use crate::tls::info::TlsInfo;
use crate::transport::Transport;

#[cfg(feature = "ws")]
use crate::ws::WsEndpoint;

pub(crate) const INITIAL_READ_CHUNK: usize = 4 * 1024;
pub(crate) const MAX_READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum CloseMode {
    #[default]
    None,
    /// Close after currently buffered writes drain.
    DrainThenClose,
    /// Abort outstanding buffered writes and close now.
    Immediate,
}

/// A request whose head is parsed but whose body is still arriving.
pub(crate) struct PendingRequest {
    pub head: RequestHead,
    pub decoder: BodyDecoder,
    pub continue_sent: bool,
}

/// Cursor of an in-progress file-send.
pub(crate) struct FileSend {
    pub file: Fd,
    pub offset: u64,
    pub remaining: u64,
}

/// An async handler in flight; response context captured at dispatch time.
pub(crate) struct AsyncTask {
    pub future: HandlerFuture,
    pub version: Version,
    pub keep_alive: bool,
    pub is_head: bool,
    pub accept_encoding: Option<HeaderValue>,
    pub stream_id: Option<u32>,
}

/// What protocol currently owns the connection's byte stream.
pub(crate) enum ConnMode {
    Http1,
    H2(Box<dyn Http2Connection>),
    #[cfg(feature = "ws")]
    Ws(Box<dyn WsEndpoint>),
}

pub(crate) struct ConnectionState {
    /// Raw bytes not yet consumed by the parser.
    pub buffer: ByteBuf64,
    /// Decoded request body being assembled.
    pub body_buffer: ByteBuf64,
    /// Outbound bytes not yet flushed.
    pub out_buffer: ByteBuf64,
    pub transport: Option<Transport>,

    pub last_activity: Instant,
    /// First byte of a still-incomplete request head; drives the
    /// headers-read timeout.
    pub header_start: Option<Instant>,
    pub handshake_start: Option<Instant>,

    pub requests_served: u32,
    pub close_mode: CloseMode,
    pub waiting_writable: bool,

    pub tls_established: bool,
    pub tls_want_read: bool,
    pub tls_want_write: bool,
    pub tls_handshake_in_flight: bool,
    pub tls_info: Option<TlsInfo>,

    /// Adaptive transport read size; doubles on full reads.
    pub read_chunk: usize,
    /// True until the first bytes decide between h1 and the h2 preface.
    pub sniffing_preface: bool,

    pub pending: Option<PendingRequest>,
    pub file_send: Option<FileSend>,
    pub async_task: Option<AsyncTask>,
    /// Requests the h2 codec materialized while a handler was in flight.
    pub h2_backlog: Vec<crate::request::Request>,
    pub mode: ConnMode,
}

impl ConnectionState {
    pub(crate) fn new() -> Self {
        Self {
            buffer: ByteBuf64::new(),
            body_buffer: ByteBuf64::new(),
            out_buffer: ByteBuf64::new(),
            transport: None,
            last_activity: Instant::now(),
            header_start: None,
            handshake_start: None,
            requests_served: 0,
            close_mode: CloseMode::None,
            waiting_writable: false,
            tls_established: false,
            tls_want_read: false,
            tls_want_write: false,
            tls_handshake_in_flight: false,
            tls_info: None,
            read_chunk: INITIAL_READ_CHUNK,
            sniffing_preface: false,
            pending: None,
            file_send: None,
            async_task: None,
            h2_backlog: Vec::new(),
            mode: ConnMode::Http1,
        }
    }

    /// Prepare a recycled state for a fresh connection, keeping buffer
    /// capacity.
    pub(crate) fn reset(&mut self) {
        self.buffer.clear();
        self.body_buffer.clear();
        self.out_buffer.clear();
        self.transport = None;
        self.last_activity = Instant::now();
        self.header_start = None;
        self.handshake_start = None;
        self.requests_served = 0;
        self.close_mode = CloseMode::None;
        self.waiting_writable = false;
        self.tls_established = false;
        self.tls_want_read = false;
        self.tls_want_write = false;
        self.tls_handshake_in_flight = false;
        self.tls_info = None;
        self.read_chunk = INITIAL_READ_CHUNK;
        self.sniffing_preface = false;
        self.pending = None;
        self.file_send = None;
        self.async_task = None;
        self.h2_backlog.clear();
        self.mode = ConnMode::Http1;
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub(crate) fn request_immediate_close(&mut self) {
        self.close_mode = CloseMode::Immediate;
    }

    /// Graceful half-close: keep the drain order if one is already set.
    pub(crate) fn request_drain_close(&mut self) {
        if self.close_mode == CloseMode::None {
            self.close_mode = CloseMode::DrainThenClose;
        }
    }

    pub(crate) fn any_close_requested(&self) -> bool {
        self.close_mode != CloseMode::None
    }

    /// Whether buffered output and an active file send are both exhausted.
    pub(crate) fn output_drained(&self) -> bool {
        self.out_buffer.is_empty()
            && self
                .file_send
                .as_ref()
                .is_none_or(|file_send| file_send.remaining == 0)
    }

    pub(crate) fn grow_read_chunk(&mut self) {
        self.read_chunk = (self.read_chunk * 2).min(MAX_READ_CHUNK);
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("buffered_in", &self.buffer.len())
            .field("buffered_out", &self.out_buffer.len())
            .field("requests_served", &self.requests_served)
            .field("close_mode", &self.close_mode)
            .field("tls_established", &self.tls_established)
            .field("tls_want_read", &self.tls_want_read)
            .field("tls_want_write", &self.tls_want_write)
            .field("handshake_start", &self.handshake_start)
            .finish()
    }
}
