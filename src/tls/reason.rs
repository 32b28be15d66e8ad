//! Handshake failure reason labels, used as counter keys in server stats.

pub const ALPN_STRICT_MISMATCH: &str = "alpn_strict_mismatch";
pub const HANDSHAKE_EOF: &str = "handshake_eof";
pub const HANDSHAKE_ERROR: &str = "handshake_error";
pub const HANDSHAKE_TIMEOUT: &str = "handshake_timeout";
pub const REJECTED_CONCURRENCY: &str = "rejected_concurrency";
pub const REJECTED_RATE_LIMIT: &str = "rejected_rate_limit";
pub const SESSION_NEW_FAILED: &str = "ssl_new_failed";
pub const SESSION_SET_FD_FAILED: &str = "ssl_set_fd_failed";
pub const SESSION_SET_EX_DATA_FAILED: &str = "ssl_set_ex_data_failed";
