//! The server: accept loop, per-fd dispatch, request cycle, timeouts,
//! lifecycle and hot updates — one single-threaded readiness reactor.

pub(crate) mod conn;
pub mod lifecycle;
pub(crate) mod listener;
pub mod probes;
pub mod stats;
pub(crate) mod storage;

use std::os::fd::{AsRawFd, RawFd};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version, header};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::config::ServerConfig;
use crate::error::Error;
use crate::event::{EventLoop, Interest, Ready};
use crate::h2::{self, Http2Engine, PrefaceMatch};
use crate::handler::{Handler, ResponseStream};
use crate::proto::decode::BodyDecoder;
use crate::proto::encode;
use crate::proto::parse::{self, RequestHead};
use crate::request::Request;
use crate::response::{Body, Response};
use crate::router::{RouteMatch, Router};
use crate::sendfile::sendfile;
use crate::transport::{Transport, TransportHint};

pub use lifecycle::{Control, State};

use conn::{AsyncTask, CloseMode, ConnMode, ConnectionState, FileSend, PendingRequest};
use lifecycle::{ControlShared, DrainIntent, Lifecycle};
use probes::{ProbeFlags, SharedProbeFlags};
use stats::ServerStats;
use storage::ConnectionStorage;

#[cfg(feature = "tls")]
use crate::config::KtlsMode;
#[cfg(feature = "tls")]
use crate::tls::admission::HandshakeAdmission;
#[cfg(feature = "tls")]
use crate::tls::context::TlsContext;
#[cfg(feature = "tls")]
use crate::tls::reason;
#[cfg(feature = "tls")]
use crate::tls::stream::{HandshakeOutcome, KtlsOffload, TlsStream};

#[cfg(feature = "ws")]
use crate::ws::{self, WsControl, WsNegotiated};

const WAKER_TOKEN: usize = usize::MAX;
const DEFAULT_MAX_CACHED_CONNECTIONS: usize = 64;
const FILE_SEND_MAX_CHUNK: usize = 1 << 20;
const TLS_FILE_CHUNK: usize = 64 * 1024;

/// Ready-queue shared with async handler wakers.
pub(crate) struct WakeQueue {
    ready: Mutex<Vec<RawFd>>,
    waker: Arc<mio::Waker>,
}

impl WakeQueue {
    fn push(&self, fd: RawFd) {
        if let Ok(mut ready) = self.ready.lock() {
            ready.push(fd);
        }
        let _ = self.waker.wake();
    }

    fn drain(&self) -> Vec<RawFd> {
        self.ready
            .lock()
            .map(|mut ready| std::mem::take(&mut *ready))
            .unwrap_or_default()
    }
}

struct TaskWaker {
    fd: RawFd,
    queue: Arc<WakeQueue>,
}

impl std::task::Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.queue.push(self.fd);
    }
}

/// What a dispatch step decided about the connection's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    CloseNow,
}

/// How serving one request left the connection.
enum Serve {
    Done,
    AsyncStarted,
    Upgraded,
    Close,
}

/// Split-borrow context threaded through the dispatch helpers.
struct Dispatch<'a> {
    config: &'a ServerConfig,
    router: &'a Router,
    stats: &'a mut ServerStats,
    probes: &'a ProbeFlags,
    event_loop: &'a EventLoop,
    wake_queue: &'a Arc<WakeQueue>,
    h2_engine: Option<&'a Arc<dyn Http2Engine>>,
}

pub struct HttpServer {
    config: ServerConfig,
    router: Router,
    event_loop: EventLoop,
    listener: Option<mio::net::TcpListener>,
    listener_fd: RawFd,
    local_port: u16,
    lifecycle: Lifecycle,
    control_shared: Arc<ControlShared>,
    waker: Arc<mio::Waker>,
    probes: SharedProbeFlags,
    storage: ConnectionStorage,
    stats: ServerStats,
    stats_snapshot: Arc<Mutex<ServerStats>>,
    wake_queue: Arc<WakeQueue>,
    h2_engine: Option<Arc<dyn Http2Engine>>,
    startup_marked: bool,
    #[cfg(feature = "tls")]
    tls_context: Option<Arc<TlsContext>>,
    #[cfg(feature = "tls")]
    admission: HandshakeAdmission,
}

impl HttpServer {
    /// Validate the configuration, bind the listener and build the TLS
    /// context. All configuration errors surface here; the server never
    /// enters `Running` on a bad config.
    pub fn new(config: ServerConfig, router: Router) -> crate::Result<Self> {
        config.validate()?;

        #[cfg(feature = "tls")]
        let tls_context = match &config.tls {
            Some(tls_config) => Some(Arc::new(TlsContext::build(tls_config)?)),
            None => None,
        };

        let event_loop = EventLoop::new().map_err(Error::new_io)?;
        let waker = event_loop.waker(WAKER_TOKEN).map_err(Error::new_io)?;
        let (listener, local_port) =
            listener::bind(config.port, config.reuse_port).map_err(Error::new_io)?;
        let listener_fd = listener.as_raw_fd();
        event_loop
            .add(listener_fd, Interest::READABLE)
            .map_err(Error::new_io)?;

        let wake_queue = Arc::new(WakeQueue {
            ready: Mutex::new(Vec::new()),
            waker: Arc::clone(&waker),
        });

        #[cfg(feature = "tls")]
        let admission = HandshakeAdmission::new(
            config
                .tls
                .as_ref()
                .map(|tls| tls.handshake)
                .unwrap_or_default(),
        );

        Ok(Self {
            config,
            router,
            event_loop,
            listener: Some(listener),
            listener_fd,
            local_port,
            lifecycle: Lifecycle::new(),
            control_shared: Arc::new(ControlShared::default()),
            waker,
            probes: Arc::new(ProbeFlags::default()),
            storage: ConnectionStorage::new(DEFAULT_MAX_CACHED_CONNECTIONS),
            stats: ServerStats::default(),
            stats_snapshot: Arc::new(Mutex::new(ServerStats::default())),
            wake_queue,
            h2_engine: None,
            startup_marked: false,
            #[cfg(feature = "tls")]
            tls_context,
            #[cfg(feature = "tls")]
            admission,
        })
    }

    /// Actual listen port (useful with port 0).
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_port
    }

    /// Cross-thread lifecycle/update handle.
    #[must_use]
    pub fn control(&self) -> Control {
        Control {
            shared: Arc::clone(&self.control_shared),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Counter snapshot from the end of the last loop iteration.
    #[must_use]
    pub fn stats_handle(&self) -> Arc<Mutex<ServerStats>> {
        Arc::clone(&self.stats_snapshot)
    }

    /// Install the external HTTP/2 frame codec.
    pub fn set_http2_engine(&mut self, engine: Arc<dyn Http2Engine>) {
        self.h2_engine = Some(engine);
    }

    /// Move the server onto a background thread; the returned handle stops
    /// and joins it.
    pub fn spawn(self) -> RunningServer {
        let control = self.control();
        let port = self.local_port;
        let stats = Arc::clone(&self.stats_snapshot);
        let mut server = self;
        let thread = std::thread::Builder::new()
            .name("petrel-reactor".into())
            .spawn(move || server.run())
            .expect("spawn reactor thread");
        RunningServer {
            control,
            thread: Some(thread),
            port,
            stats,
        }
    }

    /// Run the reactor until stopped. Blocks the calling thread.
    pub fn run(&mut self) -> crate::Result<()> {
        self.lifecycle.enter_running(&self.probes);
        tracing::info!(port = self.local_port, "server running");

        loop {
            self.apply_pending_updates();
            self.apply_control_intents();

            match self.lifecycle.state {
                State::Stopping => break,
                State::Draining => {
                    self.close_listener();
                    if self.storage.len() == 0 {
                        break;
                    }
                    if let Some(deadline) = self.lifecycle.drain_deadline
                        && Instant::now() >= deadline
                    {
                        debug!("drain deadline elapsed, force-closing connections");
                        self.close_all_connections();
                        break;
                    }
                }
                _ => {}
            }

            let timeout = self.poll_timeout();
            let mut events: SmallVec<[(usize, Ready); 64]> = SmallVec::new();
            match self.event_loop.poll(Some(timeout), |token, ready| {
                events.push((token, ready));
            }) {
                Ok(_) => {}
                Err(err) => {
                    warn!("event loop poll failed: {err}");
                    return Err(Error::new_io(err));
                }
            }

            for (token, ready) in events {
                if token == WAKER_TOKEN {
                    // nothing to do: the wakeup exists to break the poll
                    continue;
                }
                if token == self.listener_fd as usize && self.listener.is_some() {
                    if self.lifecycle.accepting() {
                        self.accept_ready();
                    }
                    continue;
                }
                let fd = token as RawFd;
                if !self.storage.contains(fd) {
                    continue;
                }
                if ready.error {
                    self.close_connection(fd);
                    continue;
                }
                // hangup alone is not terminal: a half-closed peer may still
                // have bytes to read, and the read path observes the eof
                if ready.readable {
                    self.on_client_readable(fd);
                }
                if ready.writable && self.storage.contains(fd) {
                    self.on_client_writable(fd);
                }
            }

            for fd in self.wake_queue.drain() {
                if self.storage.contains(fd) {
                    self.resume_async(fd);
                }
            }

            if !self.startup_marked {
                self.startup_marked = true;
                self.probes.startup_complete.store(true, Ordering::Relaxed);
            }

            self.run_sweeps();
            self.publish_stats();
        }

        self.shutdown_loop();
        Ok(())
    }

    fn shutdown_loop(&mut self) {
        self.close_listener();
        self.close_all_connections();
        self.publish_stats();
        self.probes.ready.store(false, Ordering::Relaxed);
        self.probes.started.store(false, Ordering::Relaxed);
        self.lifecycle.state = State::Idle;
        tracing::info!("server stopped");
    }

    fn poll_timeout(&self) -> Duration {
        let mut timeout = self.config.poll_interval;
        if self.lifecycle.state == State::Draining
            && let Some(deadline) = self.lifecycle.drain_deadline
        {
            timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
        }
        timeout
    }

    fn apply_pending_updates(&mut self) {
        let updates = &self.control_shared.updates;
        if updates.has_config.swap(false, Ordering::Acquire) {
            let mutators = updates
                .config
                .lock()
                .map(|mut queue| std::mem::take(&mut *queue))
                .unwrap_or_default();
            for mutator in mutators {
                mutator(&mut self.config);
            }
        }
        if updates.has_router.swap(false, Ordering::Acquire) {
            let mutators = updates
                .router
                .lock()
                .map(|mut queue| std::mem::take(&mut *queue))
                .unwrap_or_default();
            for mutator in mutators {
                mutator(&mut self.router);
            }
        }
    }

    fn apply_control_intents(&mut self) {
        if self.control_shared.stop_requested.load(Ordering::Acquire) {
            self.lifecycle.enter_stopping(&self.probes);
            return;
        }
        let intents = self
            .control_shared
            .drain
            .lock()
            .map(|mut drain| std::mem::take(&mut *drain))
            .unwrap_or_default();
        for intent in intents {
            match intent {
                DrainIntent::Begin(deadline) => {
                    self.lifecycle.enter_draining(deadline, &self.probes);
                }
                DrainIntent::Shrink(deadline) => {
                    self.lifecycle.shrink_deadline(Some(deadline));
                }
            }
        }
    }

    fn close_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.event_loop.remove(listener.as_raw_fd());
            drop(listener);
            trace!("listener closed");
        }
    }

    fn accept_ready(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((sock, peer)) => {
                    let _ = sock.set_nodelay(true);
                    self.stats.connections_accepted += 1;
                    let fd = sock.as_raw_fd();
                    let now = Instant::now();

                    #[cfg(feature = "tls")]
                    if let Some(tls_context) = self.tls_context.clone() {
                        match self.admission.try_admit(peer.ip(), now) {
                            Ok(()) => {}
                            Err(rejection) => {
                                trace!(peer = %peer, rejection, "tls handshake rejected");
                                self.stats.bump_handshake_failure(rejection);
                                drop(sock);
                                continue;
                            }
                        }
                        let idx = self.storage.insert(fd);
                        let conn = self.storage.get_mut(fd).expect("just inserted");
                        let _ = idx;
                        conn.transport = Some(Transport::Tls(Box::new(TlsStream::new(
                            sock,
                            tls_context,
                        ))));
                        conn.handshake_start = Some(now);
                        conn.tls_handshake_in_flight = true;
                        conn.touch(now);
                        if let Err(err) = self.event_loop.add(fd, Interest::READABLE) {
                            warn!("registering accepted connection failed: {err}");
                            self.close_connection(fd);
                        }
                        continue;
                    }

                    trace!(peer = %peer, fd, "accepted connection");
                    let idx = self.storage.insert(fd);
                    let conn = self.storage.get_mut(fd).expect("just inserted");
                    let _ = idx;
                    conn.transport = Some(Transport::plain(sock));
                    conn.tls_established = true;
                    conn.sniffing_preface = self.config.http2.enabled
                        && self.config.http2.h2c_enabled
                        && self.h2_engine.is_some();
                    conn.touch(now);
                    if let Err(err) = self.event_loop.add(fd, Interest::READABLE) {
                        warn!("registering accepted connection failed: {err}");
                        self.close_connection(fd);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    // fd exhaustion and transient accept errors must not
                    // take down the reactor
                    warn!("accept failed: {err}");
                    return;
                }
            }
        }
    }

    #[cfg(feature = "tls")]
    fn drive_handshake(&mut self, fd: RawFd) -> Flow {
        let now = Instant::now();
        let Some(conn) = self.storage.get_mut(fd) else {
            return Flow::Continue;
        };
        let Some(Transport::Tls(tls)) = conn.transport.as_mut() else {
            return Flow::Continue;
        };

        match tls.handshake_step() {
            HandshakeOutcome::WantRead => {
                conn.tls_want_read = true;
                conn.tls_want_write = false;
                Flow::Continue
            }
            HandshakeOutcome::WantWrite => {
                conn.tls_want_read = false;
                conn.tls_want_write = true;
                if !conn.waiting_writable {
                    conn.waiting_writable = true;
                    let _ = self
                        .event_loop
                        .modify(fd, Interest::READABLE | Interest::WRITABLE);
                }
                Flow::Continue
            }
            HandshakeOutcome::Fatal(failure) => {
                if failure == reason::ALPN_STRICT_MISMATCH {
                    self.stats.alpn_strict_mismatches += 1;
                }
                self.stats.bump_handshake_failure(failure);
                Flow::CloseNow
            }
            HandshakeOutcome::Done(info) => {
                conn.tls_established = true;
                conn.tls_handshake_in_flight = false;
                conn.tls_want_read = false;
                conn.tls_want_write = false;
                conn.handshake_start = None;
                conn.last_activity = now;
                self.admission.release();

                self.stats.tls_handshakes_succeeded += 1;
                if !info.alpn_protocol().is_empty() {
                    self.stats.bump_alpn(info.alpn_protocol());
                }
                if !info.version().is_empty() {
                    self.stats.bump_tls_version(info.version());
                }
                if tls.peer_presented_cert() {
                    self.stats.tls_client_cert_presented += 1;
                }

                let is_h2 = info.alpn_protocol() == h2::ALPN_H2;
                conn.tls_info = Some(info);

                // hand records to the kernel where possible
                let ktls_mode = self
                    .config
                    .tls
                    .as_ref()
                    .map(|tls_config| tls_config.ktls)
                    .unwrap_or_default();
                if ktls_mode != KtlsMode::Disabled {
                    match tls.try_ktls_offload(&mut conn.buffer) {
                        KtlsOffload::Enabled => {
                            self.stats.ktls_send_enabled_connections += 1;
                        }
                        KtlsOffload::Fallback(cause) => {
                            trace!(cause, "ktls fallback");
                            self.stats.ktls_send_enable_fallbacks += 1;
                        }
                        KtlsOffload::FatalAfterExtract => {
                            self.stats.ktls_send_enable_fallbacks += 1;
                            self.stats.ktls_send_forced_shutdowns += 1;
                            return Flow::CloseNow;
                        }
                        KtlsOffload::NotAttempted => {}
                    }
                }

                if is_h2 {
                    if let Some(engine) = &self.h2_engine {
                        if self.config.http2.enabled {
                            conn.mode = ConnMode::H2(engine.new_connection(&self.config.http2));
                        }
                    }
                } else if self.config.http2.enabled && self.h2_engine.is_some() {
                    // prior-knowledge preface is also allowed over TLS
                    conn.sniffing_preface = true;
                }

                // bytes may already sit in the buffer (early request data or
                // the ktls drain); run the regular read path now
                self.on_client_readable(fd);
                Flow::Continue
            }
        }
    }

    fn on_client_readable(&mut self, fd: RawFd) {
        #[cfg(feature = "tls")]
        {
            let handshaking = self
                .storage
                .get(fd)
                .is_some_and(|conn| conn.tls_handshake_in_flight);
            if handshaking {
                if self.drive_handshake(fd) == Flow::CloseNow {
                    self.close_connection(fd);
                }
                return;
            }
        }

        let flow = {
            let Self {
                storage,
                config,
                router,
                stats,
                probes,
                event_loop,
                wake_queue,
                h2_engine,
                ..
            } = self;
            let Some(conn) = storage.get_mut(fd) else {
                return;
            };
            let mut cx = Dispatch {
                config,
                router,
                stats,
                probes,
                event_loop,
                wake_queue,
                h2_engine: h2_engine.as_ref(),
            };
            client_readable(conn, &mut cx, fd)
        };
        if flow == Flow::CloseNow {
            self.close_connection(fd);
        }
    }

    fn on_client_writable(&mut self, fd: RawFd) {
        #[cfg(feature = "tls")]
        {
            let handshaking = self
                .storage
                .get(fd)
                .is_some_and(|conn| conn.tls_handshake_in_flight);
            if handshaking {
                if self.drive_handshake(fd) == Flow::CloseNow {
                    self.close_connection(fd);
                }
                return;
            }
        }

        let flow = {
            let Self {
                storage,
                config,
                router,
                stats,
                probes,
                event_loop,
                wake_queue,
                h2_engine,
                ..
            } = self;
            let Some(conn) = storage.get_mut(fd) else {
                return;
            };
            let mut cx = Dispatch {
                config,
                router,
                stats,
                probes,
                event_loop,
                wake_queue,
                h2_engine: h2_engine.as_ref(),
            };
            flush_output(conn, &mut cx, fd)
        };
        if flow == Flow::CloseNow {
            self.close_connection(fd);
        }
    }

    fn resume_async(&mut self, fd: RawFd) {
        let flow = {
            let Self {
                storage,
                config,
                router,
                stats,
                probes,
                event_loop,
                wake_queue,
                h2_engine,
                ..
            } = self;
            let Some(conn) = storage.get_mut(fd) else {
                return;
            };
            let mut cx = Dispatch {
                config,
                router,
                stats,
                probes,
                event_loop,
                wake_queue,
                h2_engine: h2_engine.as_ref(),
            };
            poll_async_task(conn, &mut cx, fd)
        };
        if flow == Flow::CloseNow {
            self.close_connection(fd);
        }
    }

    fn close_connection(&mut self, fd: RawFd) {
        let Some(conn) = self.storage.get_mut(fd) else {
            return;
        };

        #[cfg(feature = "tls")]
        if conn.tls_handshake_in_flight {
            conn.tls_handshake_in_flight = false;
            self.admission.release();
        }

        #[cfg(feature = "ws")]
        if let ConnMode::Ws(endpoint) = &mut conn.mode {
            endpoint.on_close();
        }

        // dropping the state cancels any in-flight coroutine frame
        #[cfg(feature = "tls")]
        if let Some(Transport::Tls(tls)) = conn.transport.as_mut() {
            tls.shutdown();
        }

        self.event_loop.remove(fd);
        self.storage.recycle_or_release(fd);
        self.stats.connections_closed += 1;
    }

    fn close_all_connections(&mut self) {
        for fd in self.storage.fds() {
            self.close_connection(fd);
        }
    }

    fn run_sweeps(&mut self) {
        let now = Instant::now();
        let keep_alive_timeout = self.config.keep_alive_timeout;
        let header_timeout = self.config.header_read_timeout;

        #[cfg(feature = "tls")]
        let handshake_timeout = self.admission.timeout();

        let mut to_close: SmallVec<[RawFd; 8]> = SmallVec::new();
        let mut to_timeout_408: SmallVec<[RawFd; 4]> = SmallVec::new();
        #[cfg(feature = "tls")]
        let mut handshake_expired: SmallVec<[RawFd; 4]> = SmallVec::new();

        for fd in self.storage.fds() {
            let Some(conn) = self.storage.get(fd) else {
                continue;
            };

            #[cfg(feature = "tls")]
            if conn.tls_handshake_in_flight {
                if let Some(started) = conn.handshake_start
                    && now.saturating_duration_since(started) > handshake_timeout
                {
                    handshake_expired.push(fd);
                }
                continue;
            }

            if let Some(header_start) = conn.header_start
                && now.saturating_duration_since(header_start) > header_timeout
            {
                to_timeout_408.push(fd);
                continue;
            }

            // an in-flight async handler keeps the connection alive
            if conn.async_task.is_none()
                && now.saturating_duration_since(conn.last_activity) > keep_alive_timeout
            {
                to_close.push(fd);
            }
        }

        #[cfg(feature = "tls")]
        for fd in handshake_expired {
            trace!(fd, "tls handshake timed out");
            self.stats.bump_handshake_failure(reason::HANDSHAKE_TIMEOUT);
            self.close_connection(fd);
        }

        for fd in to_timeout_408 {
            if let Some(conn) = self.storage.get_mut(fd) {
                let _ = encode::build_error_head(
                    StatusCode::REQUEST_TIMEOUT,
                    false,
                    &mut conn.out_buffer,
                );
                conn.request_drain_close();
            }
            self.on_client_writable(fd);
            if self.storage.contains(fd) {
                self.close_connection(fd);
            }
        }

        for fd in to_close {
            trace!(fd, "closing idle connection");
            self.close_connection(fd);
        }

        #[cfg(feature = "tls")]
        self.admission.sweep(now);

        self.storage.sweep_cached(now, keep_alive_timeout);
    }

    fn publish_stats(&mut self) {
        #[cfg(feature = "tls")]
        {
            self.stats.handshakes_in_flight = self.admission.in_flight();
        }
        self.stats.open_connections = self.storage.len();
        self.stats.cached_connections = self.storage.cached_len();
        if let Ok(mut snapshot) = self.stats_snapshot.lock() {
            *snapshot = self.stats.clone();
        }
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("port", &self.local_port)
            .field("state", &self.lifecycle.state)
            .field("connections", &self.storage.len())
            .finish()
    }
}

/// Handle to a server running on its own thread.
pub struct RunningServer {
    control: Control,
    thread: Option<std::thread::JoinHandle<crate::Result<()>>>,
    port: u16,
    stats: Arc<Mutex<ServerStats>>,
}

impl RunningServer {
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn control(&self) -> Control {
        self.control.clone()
    }

    #[must_use]
    pub fn stats(&self) -> ServerStats {
        self.stats.lock().map(|stats| stats.clone()).unwrap_or_default()
    }

    /// Signal stop and wait for the reactor to return.
    pub fn stop_and_join(mut self) -> crate::Result<()> {
        self.control.stop();
        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(result) => result,
                Err(_) => Err(Error::new_io(std::io::Error::other(
                    "reactor thread panicked",
                ))),
            },
            None => Ok(()),
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.control.stop();
            let _ = thread.join();
        }
    }
}

// ---------------------------------------------------------------------------
// dispatch helpers (free functions over split borrows)
// ---------------------------------------------------------------------------

fn ensure_writable(conn: &mut ConnectionState, cx: &Dispatch<'_>, fd: RawFd) {
    if !conn.waiting_writable {
        conn.waiting_writable = true;
        let _ = cx
            .event_loop
            .modify(fd, Interest::READABLE | Interest::WRITABLE);
    }
}

fn clear_writable(conn: &mut ConnectionState, cx: &Dispatch<'_>, fd: RawFd) {
    if conn.waiting_writable {
        conn.waiting_writable = false;
        let _ = cx.event_loop.modify(fd, Interest::READABLE);
    }
}

fn client_readable(conn: &mut ConnectionState, cx: &mut Dispatch<'_>, fd: RawFd) -> Flow {
    let now = Instant::now();
    let mut peer_closed = false;

    loop {
        let chunk = conn.read_chunk;
        let Some(transport) = conn.transport.as_mut() else {
            return Flow::CloseNow;
        };
        let result = transport.read(&mut conn.buffer, chunk);
        match result.hint {
            TransportHint::None if result.bytes == 0 => {
                peer_closed = true;
                break;
            }
            TransportHint::None => {
                conn.touch(now);
                if result.bytes == chunk {
                    conn.grow_read_chunk();
                }
            }
            TransportHint::ReadReady => break,
            TransportHint::WriteReady => {
                conn.tls_want_write = true;
                ensure_writable(conn, cx, fd);
                break;
            }
            TransportHint::Error => return Flow::CloseNow,
        }
    }

    if !conn.buffer.is_empty() || conn.pending.is_some() {
        let flow = process_input(conn, cx, fd);
        if flow == Flow::CloseNow {
            return flow;
        }
    }

    if peer_closed {
        #[cfg(feature = "ws")]
        if let ConnMode::Ws(endpoint) = &mut conn.mode {
            endpoint.on_close();
        }
        // let buffered responses drain, then close
        conn.request_drain_close();
        return flush_output(conn, cx, fd);
    }

    flush_output(conn, cx, fd)
}

fn process_input(conn: &mut ConnectionState, cx: &mut Dispatch<'_>, fd: RawFd) -> Flow {
    match &conn.mode {
        ConnMode::Http1 => h1_process(conn, cx, fd),
        ConnMode::H2(_) => h2_process(conn, cx),
        #[cfg(feature = "ws")]
        ConnMode::Ws(_) => ws_process(conn),
    }
}

fn h1_process(conn: &mut ConnectionState, cx: &mut Dispatch<'_>, fd: RawFd) -> Flow {
    // an async handler owns the connection until it completes, and a
    // connection on its way out parses nothing further
    if conn.async_task.is_some() || conn.any_close_requested() {
        return Flow::Continue;
    }

    if conn.sniffing_preface && conn.requests_served == 0 && conn.pending.is_none() {
        match h2::sniff_preface(conn.buffer.as_slice()) {
            PrefaceMatch::NeedMore => return Flow::Continue,
            PrefaceMatch::Yes => {
                conn.sniffing_preface = false;
                let Some(engine) = cx.h2_engine else {
                    return Flow::CloseNow;
                };
                conn.mode = ConnMode::H2(engine.new_connection(&cx.config.http2));
                trace!(fd, "connection switched to h2 (prior knowledge)");
                return h2_process(conn, cx);
            }
            PrefaceMatch::No => conn.sniffing_preface = false,
        }
    }

    loop {
        // finish the body of the request in flight
        if conn.pending.is_some() {
            match continue_body(conn) {
                Ok(true) => {}
                Ok(false) => return Flow::Continue,
                Err(err) => return reject(conn, &err),
            }
            let pending = conn.pending.take().expect("body just completed");
            match finish_request(conn, cx, fd, pending) {
                Serve::Done => {
                    if conn.any_close_requested() {
                        return Flow::Continue;
                    }
                    continue;
                }
                Serve::AsyncStarted => return Flow::Continue,
                // the new protocol owner picks up whatever is buffered
                Serve::Upgraded => return process_input(conn, cx, fd),
                Serve::Close => return Flow::CloseNow,
            }
        }

        if conn.buffer.is_empty() {
            conn.header_start = None;
            return Flow::Continue;
        }

        match parse::parse_head(conn.buffer.as_slice(), cx.config.max_header_bytes) {
            Ok(None) => {
                if conn.header_start.is_none() {
                    conn.header_start = Some(Instant::now());
                }
                return Flow::Continue;
            }
            Err(err) => return reject(conn, &err),
            Ok(Some((head, consumed))) => {
                conn.buffer.erase_front(consumed);
                conn.header_start = None;

                let decoder = match BodyDecoder::for_framing(head.framing, cx.config.max_body_bytes)
                {
                    Ok(decoder) => decoder,
                    Err(err) => return reject(conn, &err),
                };

                // the head is acceptable; answer Expect: 100-continue before
                // the client commits the body
                let continue_sent = head.expect_continue && !decoder.is_done();
                if continue_sent
                    && conn.out_buffer.append(encode::CONTINUE_RESPONSE).is_err()
                {
                    return Flow::CloseNow;
                }

                conn.pending = Some(PendingRequest {
                    head,
                    decoder,
                    continue_sent,
                });
            }
        }
    }
}

/// Feed buffered bytes to the body decoder. `Ok(true)` when complete.
fn continue_body(conn: &mut ConnectionState) -> Result<bool, Error> {
    let pending = conn.pending.as_mut().expect("pending request");
    if pending.decoder.is_done() {
        return Ok(true);
    }
    let (consumed, done) = pending
        .decoder
        .decode(conn.buffer.as_slice(), &mut conn.body_buffer)?;
    conn.buffer.erase_front(consumed);
    Ok(done)
}

/// Emit the minimal error response for unacceptable client input and close.
fn reject(conn: &mut ConnectionState, err: &Error) -> Flow {
    let status = err.response_status().unwrap_or(StatusCode::BAD_REQUEST);
    debug!(%status, "rejecting request: {err}");
    if encode::build_error_head(status, false, &mut conn.out_buffer).is_err() {
        return Flow::CloseNow;
    }
    conn.request_drain_close();
    conn.pending = None;
    Flow::Continue
}

fn finish_request(
    conn: &mut ConnectionState,
    cx: &mut Dispatch<'_>,
    fd: RawFd,
    mut pending: PendingRequest,
) -> Serve {
    trace!(
        fd,
        continue_sent = pending.continue_sent,
        "request body complete"
    );
    let trailers = match pending.decoder.take_trailers() {
        Ok(trailers) => trailers,
        Err(err) => {
            let _ = reject(conn, &err);
            return Serve::Done;
        }
    };

    let mut body = conn.body_buffer.take();

    #[cfg(feature = "compression")]
    if cx.config.decompress_request_body
        && let Some(coding) = request_coding(&pending.head.headers)
    {
        let mut plain = crate::buf::ByteBuf64::new();
        match crate::proto::compress::decompress(
            coding,
            &body,
            cx.config.max_decompressed_body_bytes,
            &mut plain,
        ) {
            Ok(()) => body = plain.take(),
            Err(err) => {
                let _ = reject(conn, &err);
                return Serve::Done;
            }
        }
    }

    execute_request(conn, cx, fd, pending.head, Bytes::from(body), trailers)
}

#[cfg(feature = "compression")]
fn request_coding(headers: &HeaderMap) -> Option<crate::proto::compress::Coding> {
    let value = headers.get(header::CONTENT_ENCODING)?;
    crate::proto::compress::Coding::from_token(value.as_bytes())
}

/// Response context captured from a request head.
#[derive(Clone)]
struct RespondMeta {
    version: Version,
    keep_alive: bool,
    is_head: bool,
    accept_encoding: Option<HeaderValue>,
    stream_id: Option<u32>,
}

fn execute_request(
    conn: &mut ConnectionState,
    cx: &mut Dispatch<'_>,
    fd: RawFd,
    head: RequestHead,
    body: Bytes,
    trailers: Option<HeaderMap>,
) -> Serve {
    conn.requests_served += 1;
    cx.stats.total_requests += 1;

    let keep_alive = head.keep_alive
        && cx.config.keep_alive_enabled
        && conn.requests_served < cx.config.max_requests_per_connection;
    let meta = RespondMeta {
        version: head.version,
        keep_alive,
        is_head: head.method == Method::HEAD,
        accept_encoding: head.headers.get(header::ACCEPT_ENCODING).cloned(),
        stream_id: None,
    };

    // built-in probes short-circuit routing
    if let Some(response) = probes::respond(&cx.config.probes, cx.probes, &head.path) {
        write_response(conn, cx, &meta, response);
        if !keep_alive {
            conn.request_drain_close();
        }
        return Serve::Done;
    }

    let request = Request::new(
        head.method.clone(),
        head.path,
        head.version,
        head.headers,
        body,
        trailers,
        conn.tls_info.clone(),
        None,
    );

    // upgrades beat routing
    #[cfg(feature = "ws")]
    if ws::is_upgrade_request(request.method(), request.headers())
        && let Some(factory) = cx.router.find_websocket(request.path())
    {
        let Some(handshake) = ws::parse_handshake(&request, &cx.config.ws_deflate) else {
            let _ = encode::build_error_head(StatusCode::BAD_REQUEST, false, &mut conn.out_buffer);
            conn.request_drain_close();
            return Serve::Done;
        };
        if ws::build_upgrade_response(&handshake, &mut conn.out_buffer).is_err() {
            return Serve::Close;
        }
        let negotiated = WsNegotiated {
            deflate: handshake.deflate,
        };
        let mut endpoint = factory(&request, &negotiated);
        endpoint.on_open(&negotiated);
        conn.mode = ConnMode::Ws(endpoint);
        trace!(fd, path = request.path(), "websocket upgrade");
        return Serve::Upgraded;
    }

    if cx.config.http2.enabled
        && cx.config.http2.h2c_upgrade_enabled
        && request.version() == Version::HTTP_11
        && h2::wants_h2c_upgrade(&request)
        && let Some(engine) = cx.h2_engine
    {
        if h2::build_h2c_switch_response(&mut conn.out_buffer).is_err() {
            return Serve::Close;
        }
        let mut h2_conn = engine.new_connection(&cx.config.http2);
        let mut out = Vec::new();
        if h2_conn.accept_upgrade(request, &mut out).is_err() {
            return Serve::Close;
        }
        if conn.out_buffer.append(&out).is_err() {
            return Serve::Close;
        }
        conn.mode = ConnMode::H2(h2_conn);
        trace!(fd, "connection switched to h2 (upgrade)");
        return Serve::Upgraded;
    }

    match cx.router.find(request.method(), request.path()) {
        RouteMatch::NotFound => {
            let _ = encode::build_error_head(StatusCode::NOT_FOUND, keep_alive, &mut conn.out_buffer);
        }
        RouteMatch::MethodNotAllowed => {
            let _ = encode::build_error_head(
                StatusCode::METHOD_NOT_ALLOWED,
                keep_alive,
                &mut conn.out_buffer,
            );
        }
        #[cfg(feature = "ws")]
        RouteMatch::Websocket(_) => {
            // a ws route hit without upgrade headers is a plain 404
            let _ = encode::build_error_head(StatusCode::NOT_FOUND, keep_alive, &mut conn.out_buffer);
        }
        RouteMatch::Handler(Handler::Sync(f)) => {
            let response = match catch_unwind(AssertUnwindSafe(|| f(&request))) {
                Ok(response) => response,
                Err(_) => {
                    debug!("handler panicked, responding 500");
                    Response::new(StatusCode::INTERNAL_SERVER_ERROR)
                }
            };
            write_response(conn, cx, &meta, response);
        }
        RouteMatch::Handler(Handler::Streaming(f)) => {
            let (ran, clean, head_sent) = {
                let mut stream = ResponseStream::new(
                    &mut conn.out_buffer,
                    meta.version,
                    meta.keep_alive,
                    meta.is_head,
                );
                let ran = catch_unwind(AssertUnwindSafe(|| f(&request, &mut stream))).is_ok();
                (ran, stream.finished_cleanly(), stream.head_sent())
            };
            if !ran || !clean {
                if head_sent {
                    // mid-stream failure: nothing recoverable on the wire
                    return Serve::Close;
                }
                let _ = encode::build_error_head(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    meta.keep_alive,
                    &mut conn.out_buffer,
                );
            }
        }
        RouteMatch::Handler(Handler::Async(f)) => {
            let future = f(request);
            conn.async_task = Some(AsyncTask {
                future,
                version: meta.version,
                keep_alive: meta.keep_alive,
                is_head: meta.is_head,
                accept_encoding: meta.accept_encoding.clone(),
                stream_id: meta.stream_id,
            });
            if !keep_alive {
                conn.request_drain_close();
            }
            return match poll_async_task(conn, cx, fd) {
                Flow::Continue => {
                    if conn.async_task.is_some() {
                        Serve::AsyncStarted
                    } else {
                        Serve::Done
                    }
                }
                Flow::CloseNow => Serve::Close,
            };
        }
    }

    if !keep_alive {
        conn.request_drain_close();
    }
    Serve::Done
}

fn poll_async_task(conn: &mut ConnectionState, cx: &mut Dispatch<'_>, fd: RawFd) -> Flow {
    let Some(task) = conn.async_task.as_mut() else {
        return Flow::Continue;
    };
    let waker = Waker::from(Arc::new(TaskWaker {
        fd,
        queue: Arc::clone(cx.wake_queue),
    }));
    let mut poll_cx = Context::from_waker(&waker);

    match task.future.as_mut().poll(&mut poll_cx) {
        Poll::Pending => Flow::Continue,
        Poll::Ready(response) => {
            let task = conn.async_task.take().expect("task just polled");
            let meta = RespondMeta {
                version: task.version,
                keep_alive: task.keep_alive,
                is_head: task.is_head,
                accept_encoding: task.accept_encoding,
                stream_id: task.stream_id,
            };
            match &mut conn.mode {
                ConnMode::H2(h2_conn) => {
                    let mut out = Vec::new();
                    let stream_id = meta.stream_id.unwrap_or(1);
                    if h2_conn.respond(stream_id, &response, &mut out).is_err()
                        || conn.out_buffer.append(&out).is_err()
                    {
                        return Flow::CloseNow;
                    }
                }
                _ => write_response(conn, cx, &meta, response),
            }
            // parsing resumes; pipelined bytes may already be buffered
            let flow = process_input(conn, cx, fd);
            if flow == Flow::CloseNow {
                return flow;
            }
            flush_output(conn, cx, fd)
        }
    }
}

fn write_response(
    conn: &mut ConnectionState,
    cx: &mut Dispatch<'_>,
    meta: &RespondMeta,
    mut response: Response,
) {
    #[cfg(feature = "compression")]
    maybe_compress_response(cx, meta, &mut response);

    let body_len = response.body_len();
    let fields = encode::HeadFields {
        version: meta.version,
        status: response.status(),
        reason: response.reason(),
        content_type: response.content_type(),
        content_encoding: response.content_encoding().map(HeaderValue::as_bytes),
        body_len: Some(body_len),
        keep_alive: meta.keep_alive,
        extra: response.headers(),
    };
    if encode::build_head(&fields, &mut conn.out_buffer).is_err() {
        conn.request_immediate_close();
        return;
    }

    if meta.is_head {
        return;
    }

    match response.take_body() {
        Body::Bytes(bytes) => {
            if conn.out_buffer.append(&bytes).is_err() {
                conn.request_immediate_close();
            }
        }
        Body::File(slice) => {
            conn.file_send = Some(FileSend {
                file: slice.file,
                offset: slice.offset,
                remaining: slice.len,
            });
        }
    }
}

#[cfg(feature = "compression")]
fn maybe_compress_response(cx: &Dispatch<'_>, meta: &RespondMeta, response: &mut Response) {
    use crate::proto::compress;

    if !cx.config.response_compression.enabled || response.content_encoding().is_some() {
        return;
    }
    let Body::Bytes(bytes) = response.body() else {
        return;
    };
    if bytes.len() < cx.config.response_compression.min_bytes {
        return;
    }
    let Some(coding) = compress::select_response_coding(meta.accept_encoding.as_ref()) else {
        return;
    };
    let Ok(packed) = compress::compress(coding, bytes) else {
        return;
    };
    if packed.len() >= bytes.len() {
        return;
    }
    *response.body_mut() = Body::Bytes(packed);
    *response = std::mem::take(response).with_header(
        header::CONTENT_ENCODING,
        HeaderValue::from_static(coding.token()),
    );
}

fn h2_process(conn: &mut ConnectionState, cx: &mut Dispatch<'_>) -> Flow {
    // pull whatever the codec can materialize from the buffered bytes
    if !conn.buffer.is_empty() {
        let ConnMode::H2(h2_conn) = &mut conn.mode else {
            return Flow::Continue;
        };
        let input = conn.buffer.take();
        let mut out = Vec::new();
        match h2_conn.recv(&input, &mut out) {
            Ok(requests) => {
                let tls_info = &conn.tls_info;
                conn.h2_backlog.extend(requests.into_iter().map(|mut request| {
                    request.set_tls_info(tls_info.clone());
                    request
                }));
            }
            Err(err) => {
                debug!("h2 codec error: {err}");
                h2_conn.goaway(&mut out);
                let _ = conn.out_buffer.append(&out);
                conn.request_drain_close();
                return Flow::Continue;
            }
        }
        if conn.out_buffer.append(&out).is_err() {
            return Flow::CloseNow;
        }
    }

    // serve streams in arrival order, one handler in flight at a time
    while conn.async_task.is_none() && !conn.h2_backlog.is_empty() {
        let request = conn.h2_backlog.remove(0);
        let stream_id = request.stream_id().unwrap_or(1);
        cx.stats.total_requests += 1;
        conn.requests_served += 1;

        let is_head = request.method() == Method::HEAD;
        let accept_encoding = request.headers().get(header::ACCEPT_ENCODING).cloned();

        let response = if let Some(probe) =
            probes::respond(&cx.config.probes, cx.probes, request.path())
        {
            Some(probe)
        } else {
            match cx.router.find(request.method(), request.path()) {
                RouteMatch::NotFound => Some(Response::new(StatusCode::NOT_FOUND)),
                RouteMatch::MethodNotAllowed => {
                    Some(Response::new(StatusCode::METHOD_NOT_ALLOWED))
                }
                #[cfg(feature = "ws")]
                RouteMatch::Websocket(_) => Some(Response::new(StatusCode::NOT_FOUND)),
                RouteMatch::Handler(Handler::Sync(f)) => {
                    match catch_unwind(AssertUnwindSafe(|| f(&request))) {
                        Ok(response) => Some(response),
                        Err(_) => Some(Response::new(StatusCode::INTERNAL_SERVER_ERROR)),
                    }
                }
                // streaming handlers emit h1 framing; not available per-stream
                RouteMatch::Handler(Handler::Streaming(_)) => {
                    Some(Response::new(StatusCode::INTERNAL_SERVER_ERROR))
                }
                RouteMatch::Handler(Handler::Async(f)) => {
                    conn.async_task = Some(AsyncTask {
                        future: f(request),
                        version: Version::HTTP_2,
                        keep_alive: true,
                        is_head,
                        accept_encoding,
                        stream_id: Some(stream_id),
                    });
                    None
                }
            }
        };

        if let Some(response) = response {
            let ConnMode::H2(h2_conn) = &mut conn.mode else {
                return Flow::Continue;
            };
            let mut out = Vec::new();
            if h2_conn.respond(stream_id, &response, &mut out).is_err()
                || conn.out_buffer.append(&out).is_err()
            {
                return Flow::CloseNow;
            }
        }
    }

    Flow::Continue
}

#[cfg(feature = "ws")]
fn ws_process(conn: &mut ConnectionState) -> Flow {
    let ConnMode::Ws(endpoint) = &mut conn.mode else {
        return Flow::Continue;
    };
    if conn.buffer.is_empty() {
        return Flow::Continue;
    }
    let input = conn.buffer.take();
    let mut out = Vec::new();
    let control = endpoint.on_bytes(&input, &mut out);
    if conn.out_buffer.append(&out).is_err() {
        return Flow::CloseNow;
    }
    if control == WsControl::Close {
        endpoint.on_close();
        conn.request_drain_close();
    }
    Flow::Continue
}

fn flush_output(conn: &mut ConnectionState, cx: &mut Dispatch<'_>, fd: RawFd) -> Flow {
    loop {
        if !conn.out_buffer.is_empty() {
            let Some(transport) = conn.transport.as_mut() else {
                return Flow::CloseNow;
            };
            let result = transport.write(conn.out_buffer.as_slice());
            conn.out_buffer.erase_front(result.bytes);
            match result.hint {
                TransportHint::None => {
                    if !conn.out_buffer.is_empty() {
                        continue;
                    }
                }
                TransportHint::WriteReady => {
                    ensure_writable(conn, cx, fd);
                    return Flow::Continue;
                }
                TransportHint::ReadReady => {
                    conn.tls_want_read = true;
                    return Flow::Continue;
                }
                TransportHint::Error => return Flow::CloseNow,
            }
        }

        if conn
            .file_send
            .as_ref()
            .is_some_and(|file_send| file_send.remaining > 0)
        {
            match pump_file_send(conn, cx, fd) {
                PumpStatus::Drained => continue,
                PumpStatus::Blocked => return Flow::Continue,
                PumpStatus::MoreBuffered => continue,
                PumpStatus::Failed => return Flow::CloseNow,
            }
        }

        conn.file_send = None;
        if conn.any_close_requested() {
            return match conn.close_mode {
                CloseMode::Immediate | CloseMode::DrainThenClose => Flow::CloseNow,
                CloseMode::None => Flow::Continue,
            };
        }
        clear_writable(conn, cx, fd);
        return Flow::Continue;
    }
}

enum PumpStatus {
    /// File fully sent.
    Drained,
    /// Need writability.
    Blocked,
    /// TLS path refilled the outbound buffer; flush again.
    MoreBuffered,
    Failed,
}

fn pump_file_send(conn: &mut ConnectionState, cx: &mut Dispatch<'_>, fd: RawFd) -> PumpStatus {
    enum Step {
        Drained,
        NeedWritable,
        BufferedChunk,
        Failed,
    }

    let step = {
        let Some(file_send) = conn.file_send.as_mut() else {
            return PumpStatus::Drained;
        };
        let Some(transport) = conn.transport.as_mut() else {
            return PumpStatus::Failed;
        };

        let use_kernel_path = match transport {
            Transport::Plain(_) => true,
            #[cfg(feature = "tls")]
            Transport::Tls(tls) => tls.is_kernel_offloaded(),
        };

        if use_kernel_path {
            #[cfg(feature = "tls")]
            let count_ktls = matches!(transport, Transport::Tls(_));
            #[cfg(not(feature = "tls"))]
            let count_ktls = false;

            loop {
                if file_send.remaining == 0 {
                    break Step::Drained;
                }
                let want = (file_send.remaining as usize).min(FILE_SEND_MAX_CHUNK);
                match sendfile(
                    transport.raw_fd(),
                    file_send.file.raw(),
                    &mut file_send.offset,
                    want,
                ) {
                    Ok(0) => {
                        // file shorter than advertised; the response cannot
                        // be completed
                        debug!(fd, "file send hit eof early");
                        break Step::Failed;
                    }
                    Ok(sent) => {
                        file_send.remaining -= sent as u64;
                        if count_ktls {
                            cx.stats.ktls_send_bytes += sent as u64;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        break Step::NeedWritable;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        if count_ktls {
                            // a partial kernel-tls record we cannot recover
                            // from in user space
                            cx.stats.ktls_send_forced_shutdowns += 1;
                        }
                        debug!(fd, "sendfile failed: {err}");
                        break Step::Failed;
                    }
                }
            }
        } else {
            // user-space TLS: stage one chunk through the outbound buffer
            // and let the regular flush path encrypt it
            let want = (file_send.remaining as usize).min(TLS_FILE_CHUNK);
            let mut chunk = vec![0u8; want];
            let read = unsafe {
                libc::pread(
                    file_send.file.raw(),
                    chunk.as_mut_ptr().cast(),
                    want,
                    file_send.offset as libc::off_t,
                )
            };
            if read <= 0 {
                if read == 0 {
                    debug!(fd, "file send hit eof early");
                }
                Step::Failed
            } else {
                let read = read as usize;
                file_send.offset += read as u64;
                file_send.remaining -= read as u64;
                if conn.out_buffer.append(&chunk[..read]).is_err() {
                    Step::Failed
                } else {
                    Step::BufferedChunk
                }
            }
        }
    };

    match step {
        Step::Drained => {
            conn.file_send = None;
            PumpStatus::Drained
        }
        Step::NeedWritable => {
            ensure_writable(conn, cx, fd);
            PumpStatus::Blocked
        }
        Step::BufferedChunk => PumpStatus::MoreBuffered,
        Step::Failed => PumpStatus::Failed,
    }
}
