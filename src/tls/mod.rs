//! TLS termination: context lifecycle, handshake admission, session
//! tickets, the record-framed stream and optional kernel offload.

pub mod info;
pub mod reason;

#[cfg(feature = "tls")]
pub(crate) mod admission;
#[cfg(feature = "tls")]
pub mod context;
#[cfg(all(feature = "tls", target_os = "linux"))]
pub(crate) mod ktls;
#[cfg(feature = "tls")]
pub mod stream;
#[cfg(feature = "tls")]
pub(crate) mod ticket;

pub use info::TlsInfo;
