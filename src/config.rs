//! Server configuration: fluent builders, validated before the server runs.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;
use crate::server::probes::ProbesConfig;

/// PEM material, loaded from disk or supplied in memory.
#[derive(Debug, Clone)]
pub enum PemItem {
    Path(PathBuf),
    Memory(Vec<u8>),
}

impl From<&str> for PemItem {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<PathBuf> for PemItem {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<Vec<u8>> for PemItem {
    fn from(pem: Vec<u8>) -> Self {
        Self::Memory(pem)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientCertMode {
    /// Never ask for a client certificate.
    #[default]
    None,
    /// Ask; the handshake proceeds without one.
    Request,
    /// Ask and abort the handshake when none is presented.
    Require,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KtlsMode {
    /// Try kernel TLS, silently fall back to user-space records.
    #[default]
    Auto,
    /// Try kernel TLS, count fallbacks.
    Enabled,
    Disabled,
}

/// Session ticket configuration.
#[derive(Debug, Clone)]
pub struct TicketConfig {
    pub enabled: bool,
    /// Total ticket lifetime; a fresh key is generated every
    /// `lifetime / max_keys`.
    pub lifetime: Duration,
    pub max_keys: usize,
    /// 48-byte static key (16B name + 32B AEAD key); disables rotation.
    pub static_key: Option<[u8; 48]>,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lifetime: Duration::from_secs(2 * 60 * 60),
            max_keys: 4,
            static_key: None,
        }
    }
}

/// TLS handshake admission control.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeAdmissionConfig {
    /// Concurrent in-flight handshake cap; 0 means unlimited.
    pub max_in_flight: u32,
    /// Per-source-IP token bucket; 0.0 disables the rate limit.
    pub rate_tokens_per_sec: f64,
    pub rate_burst: u32,
    pub timeout: Duration,
}

impl Default for HandshakeAdmissionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 0,
            rate_tokens_per_sec: 0.0,
            rate_burst: 8,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: PemItem,
    pub key: PemItem,
    pub trusted_client_certs: Vec<PemItem>,
    pub client_cert_mode: ClientCertMode,
    /// Protocol bounds as "1.2" / "1.3"; invalid strings fail construction.
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    /// Cipher suite names; unknown names fail construction.
    pub cipher_list: Vec<String>,
    /// Server preference order; first client-supported entry wins.
    pub alpn: Vec<String>,
    /// Abort the handshake when the client offers ALPN with no overlap.
    pub alpn_strict: bool,
    pub tickets: TicketConfig,
    pub ktls: KtlsMode,
    pub handshake: HandshakeAdmissionConfig,
}

impl TlsConfig {
    #[must_use]
    pub fn new(cert: impl Into<PemItem>, key: impl Into<PemItem>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
            trusted_client_certs: Vec::new(),
            client_cert_mode: ClientCertMode::None,
            min_version: None,
            max_version: None,
            cipher_list: Vec::new(),
            alpn: Vec::new(),
            alpn_strict: false,
            tickets: TicketConfig::default(),
            ktls: KtlsMode::default(),
            handshake: HandshakeAdmissionConfig::default(),
        }
    }

    #[must_use]
    pub fn with_trusted_client_certs(
        mut self,
        certs: impl IntoIterator<Item = PemItem>,
        mode: ClientCertMode,
    ) -> Self {
        self.trusted_client_certs = certs.into_iter().collect();
        self.client_cert_mode = mode;
        self
    }

    #[must_use]
    pub fn with_version_bounds(
        mut self,
        min: Option<impl Into<String>>,
        max: Option<impl Into<String>>,
    ) -> Self {
        self.min_version = min.map(Into::into);
        self.max_version = max.map(Into::into);
        self
    }

    #[must_use]
    pub fn with_cipher_list(mut self, suites: impl IntoIterator<Item = String>) -> Self {
        self.cipher_list = suites.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_alpn(mut self, protocols: impl IntoIterator<Item = String>, strict: bool) -> Self {
        self.alpn = protocols.into_iter().collect();
        self.alpn_strict = strict;
        self
    }

    #[must_use]
    pub fn with_tickets(mut self, tickets: TicketConfig) -> Self {
        self.tickets = tickets;
        self
    }

    #[must_use]
    pub fn with_ktls_mode(mut self, ktls: KtlsMode) -> Self {
        self.ktls = ktls;
        self
    }

    #[must_use]
    pub fn with_handshake_admission(mut self, handshake: HandshakeAdmissionConfig) -> Self {
        self.handshake = handshake;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Http2Config {
    pub enabled: bool,
    /// Accept the cleartext prior-knowledge preface.
    pub h2c_enabled: bool,
    /// Accept `Upgrade: h2c` on an HTTP/1.1 request.
    pub h2c_upgrade_enabled: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            enabled: false,
            h2c_enabled: false,
            h2c_upgrade_enabled: false,
            max_concurrent_streams: 128,
            initial_window_size: 65_535,
        }
    }
}

/// permessage-deflate configuration (RFC 7692).
#[derive(Debug, Clone)]
pub struct WsDeflateConfig {
    pub enabled: bool,
    /// 0 = no compression, 9 = best.
    pub compression_level: u32,
    /// LZ77 window of the server's compression context, 2^N bytes, N in 8..=15.
    pub server_max_window_bits: u8,
    /// LZ77 window of the client's compression context.
    pub client_max_window_bits: u8,
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    /// Messages below this size are sent uncompressed.
    pub min_compress_size: usize,
}

impl Default for WsDeflateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            compression_level: 6,
            server_max_window_bits: 15,
            client_max_window_bits: 15,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            min_compress_size: 64,
        }
    }
}

/// Response compression policy.
#[derive(Debug, Clone)]
pub struct ResponseCompressionConfig {
    pub enabled: bool,
    /// Bodies below this size are never compressed.
    pub min_bytes: usize,
}

impl Default for ResponseCompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_bytes: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port; 0 picks an ephemeral port.
    pub port: u16,
    pub reuse_port: bool,
    pub max_header_bytes: usize,
    pub max_body_bytes: u64,
    /// Bound on decompressed request bodies; guards compression bombs.
    pub max_decompressed_body_bytes: u64,
    pub decompress_request_body: bool,
    pub response_compression: ResponseCompressionConfig,
    pub max_requests_per_connection: u32,
    pub keep_alive_timeout: Duration,
    pub keep_alive_enabled: bool,
    pub header_read_timeout: Duration,
    pub poll_interval: Duration,
    pub probes: ProbesConfig,
    pub tls: Option<TlsConfig>,
    pub http2: Http2Config,
    pub ws_deflate: WsDeflateConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            reuse_port: false,
            max_header_bytes: 8 * 1024,
            max_body_bytes: 1 << 20,
            max_decompressed_body_bytes: 8 << 20,
            decompress_request_body: false,
            response_compression: ResponseCompressionConfig::default(),
            max_requests_per_connection: 100,
            keep_alive_timeout: Duration::from_secs(5),
            keep_alive_enabled: true,
            header_read_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            probes: ProbesConfig::default(),
            tls: None,
            http2: Http2Config::default(),
            ws_deflate: WsDeflateConfig::default(),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_reuse_port(mut self, on: bool) -> Self {
        self.reuse_port = on;
        self
    }

    #[must_use]
    pub fn with_max_header_bytes(mut self, max: usize) -> Self {
        self.max_header_bytes = max;
        self
    }

    #[must_use]
    pub fn with_max_body_bytes(mut self, max: u64) -> Self {
        self.max_body_bytes = max;
        self
    }

    #[must_use]
    pub fn with_max_decompressed_body_bytes(mut self, max: u64) -> Self {
        self.max_decompressed_body_bytes = max;
        self
    }

    #[must_use]
    pub fn with_request_decompression(mut self, on: bool) -> Self {
        self.decompress_request_body = on;
        self
    }

    #[must_use]
    pub fn with_response_compression(mut self, config: ResponseCompressionConfig) -> Self {
        self.response_compression = config;
        self
    }

    #[must_use]
    pub fn with_max_requests_per_connection(mut self, max: u32) -> Self {
        self.max_requests_per_connection = max;
        self
    }

    #[must_use]
    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, on: bool) -> Self {
        self.keep_alive_enabled = on;
        self
    }

    #[must_use]
    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_probes(mut self, probes: ProbesConfig) -> Self {
        self.probes = probes;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn with_http2(mut self, http2: Http2Config) -> Self {
        self.http2 = http2;
        self
    }

    #[must_use]
    pub fn with_ws_deflate(mut self, deflate: WsDeflateConfig) -> Self {
        self.ws_deflate = deflate;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.probes.validate()?;

        if self.max_header_bytes == 0 {
            return Err(Error::new_config("max_header_bytes must be non-zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::new_config("poll_interval must be non-zero"));
        }

        if let Some(tls) = &self.tls {
            #[cfg(not(feature = "tls"))]
            {
                let _ = tls;
                return Err(Error::new_config(
                    "tls configured but the `tls` feature is not enabled",
                ));
            }
            #[cfg(feature = "tls")]
            {
                for version in [&tls.min_version, &tls.max_version].into_iter().flatten() {
                    if !matches!(version.as_str(), "1.2" | "1.3") {
                        return Err(Error::new_config(format!(
                            "unsupported tls protocol version {version:?}"
                        )));
                    }
                }
                if let (Some(min), Some(max)) = (&tls.min_version, &tls.max_version)
                    && min == "1.3"
                    && max == "1.2"
                {
                    return Err(Error::new_config("tls min_version above max_version"));
                }
                if tls.tickets.enabled && tls.tickets.max_keys == 0 {
                    return Err(Error::new_config("ticket max_keys must be non-zero"));
                }
                if tls.client_cert_mode != ClientCertMode::None
                    && tls.trusted_client_certs.is_empty()
                {
                    return Err(Error::new_config(
                        "client certificates requested but no trust anchors configured",
                    ));
                }
            }
        }

        let deflate = &self.ws_deflate;
        if deflate.enabled {
            for bits in [deflate.server_max_window_bits, deflate.client_max_window_bits] {
                if !(8..=15).contains(&bits) {
                    return Err(Error::new_config(format!(
                        "deflate window bits {bits} outside 8..=15"
                    )));
                }
            }
            if deflate.compression_level > 9 {
                return Err(Error::new_config("deflate compression level above 9"));
            }
        }

        if self.http2.enabled {
            if self.http2.initial_window_size == 0 {
                return Err(Error::new_config("h2 initial window size must be non-zero"));
            }
            if self.http2.initial_window_size > (1 << 31) - 1 {
                return Err(Error::new_config("h2 initial window size above 2^31-1"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.max_header_bytes, 8 * 1024);
        assert_eq!(config.max_body_bytes, 1 << 20);
        assert_eq!(config.max_requests_per_connection, 100);
        assert_eq!(config.keep_alive_timeout, Duration::from_secs(5));
        assert!(config.keep_alive_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_probe_path_fails_validation() {
        let config = ServerConfig::default()
            .with_probes(ProbesConfig::enabled().with_liveness_path("livez"));
        assert!(config.validate().is_err());
    }

    #[cfg(feature = "tls")]
    #[test]
    fn bad_tls_version_fails_validation() {
        let config = ServerConfig::default().with_tls(
            TlsConfig::new("cert.pem", "key.pem")
                .with_version_bounds(Some("1.1"), None::<String>),
        );
        assert!(config.validate().is_err());
    }

    #[cfg(feature = "tls")]
    #[test]
    fn client_cert_mode_requires_trust_anchors() {
        let mut tls = TlsConfig::new("cert.pem", "key.pem");
        tls.client_cert_mode = ClientCertMode::Require;
        let config = ServerConfig::default().with_tls(tls);
        assert!(config.validate().is_err());
    }

    #[test]
    fn deflate_window_bits_validated() {
        let mut deflate = WsDeflateConfig::default();
        deflate.enabled = true;
        deflate.server_max_window_bits = 7;
        let config = ServerConfig::default().with_ws_deflate(deflate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn h2_window_bounds_validated() {
        let mut http2 = Http2Config::default();
        http2.enabled = true;
        http2.initial_window_size = 0;
        let config = ServerConfig::default().with_http2(http2);
        assert!(config.validate().is_err());
    }
}
