//! petrel — an event-driven HTTP server engine.
//!
//! A single-threaded readiness reactor multiplexes a listening socket, a
//! wakeup handle and many non-blocking client connections. On top of it:
//! HTTP/1.0 and HTTP/1.1 with keep-alive and pipelining, optional TLS
//! termination (ALPN, mutual auth, session tickets, kernel TLS offload),
//! WebSocket upgrades with permessage-deflate, kernel-assisted file
//! transmission, and integration points for an external HTTP/2 frame codec.
//!
//! ## Features
//!
//! - `tls` *(default)*: rustls-backed TLS termination
//! - `compression` *(default)*: gzip/deflate request decompression and
//!   response compression (`brotli` and `zstd` add those codecs)
//! - `ws` *(default)*: WebSocket upgrade handshake + permessage-deflate
//!
//! ## Example
//!
//! ```no_run
//! use petrel::{HttpServer, Response, Router, ServerConfig};
//!
//! fn main() -> petrel::Result<()> {
//!     let mut router = Router::new();
//!     router.get("/hello", |_req| Response::ok().with_body("hello\n"));
//!
//!     let config = ServerConfig::default().with_port(0);
//!     let mut server = HttpServer::new(config, router)?;
//!     println!("listening on port {}", server.port());
//!     server.run()
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

pub mod buf;
pub mod concat;
pub mod config;
pub mod error;
pub mod event;
pub mod fd;
pub mod h2;
pub mod handler;
pub mod method;
pub mod pool;
pub(crate) mod proto;
pub mod request;
pub mod response;
pub mod router;
pub(crate) mod sendfile;
pub mod server;
pub mod tls;
pub mod transport;

#[cfg(feature = "ws")]
pub mod ws;

pub use self::config::{
    ClientCertMode, HandshakeAdmissionConfig, Http2Config, KtlsMode, PemItem,
    ResponseCompressionConfig, ServerConfig, TicketConfig, TlsConfig, WsDeflateConfig,
};
pub use self::error::{BoxError, Error, Result};
pub use self::handler::{Handler, ResponseStream};
pub use self::method::MethodSet;
pub use self::request::Request;
pub use self::response::Response;
pub use self::router::Router;
pub use self::server::probes::ProbesConfig;
pub use self::server::stats::ServerStats;
pub use self::server::{Control, HttpServer, RunningServer, State};
pub use self::tls::TlsInfo;
pub use self::transport::TransportHint;
