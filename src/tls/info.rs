//! Negotiated-session info packed into a single allocation.

use crate::concat::PackedParts;

/// ALPN protocol, cipher suite, protocol version and peer certificate
/// subject of an established TLS session, stored contiguously.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    parts: PackedParts<4>,
}

impl TlsInfo {
    #[must_use]
    pub fn new(alpn: &str, cipher: &str, version: &str, peer_subject: &str) -> Self {
        Self {
            parts: PackedParts::new([alpn, cipher, version, peer_subject]),
        }
    }

    /// Negotiated ALPN protocol, empty when none was selected.
    #[must_use]
    pub fn alpn_protocol(&self) -> &str {
        self.parts.get(0)
    }

    #[must_use]
    pub fn cipher(&self) -> &str {
        self.parts.get(1)
    }

    #[must_use]
    pub fn version(&self) -> &str {
        self.parts.get(2)
    }

    /// RFC 2253 subject of the client certificate, empty when the peer did
    /// not present one.
    #[must_use]
    pub fn peer_subject(&self) -> &str {
        self.parts.get(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_all_four_parts() {
        let info = TlsInfo::new("h2", "TLS13_AES_128_GCM_SHA256", "TLSv1.3", "CN=client");
        assert_eq!(info.alpn_protocol(), "h2");
        assert_eq!(info.cipher(), "TLS13_AES_128_GCM_SHA256");
        assert_eq!(info.version(), "TLSv1.3");
        assert_eq!(info.peer_subject(), "CN=client");
    }

    #[test]
    fn default_is_all_empty() {
        let info = TlsInfo::default();
        assert!(info.alpn_protocol().is_empty());
        assert!(info.peer_subject().is_empty());
    }
}
