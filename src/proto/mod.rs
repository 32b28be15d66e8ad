//! HTTP/1.x wire protocol: head parsing, body framing, response writing.

pub(crate) mod chunked;
#[cfg(feature = "compression")]
pub(crate) mod compress;
pub(crate) mod date;
pub(crate) mod decode;
pub(crate) mod encode;
pub(crate) mod parse;
