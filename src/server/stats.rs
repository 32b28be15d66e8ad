//! Monotonic server counters. Mutated only on the loop thread; external
//! readers receive a consistent snapshot copied at the end of each loop
//! iteration.

/// Counter snapshot exposed by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_requests: u64,
    pub connections_accepted: u64,
    pub connections_closed: u64,

    pub tls_handshakes_succeeded: u64,
    pub tls_client_cert_presented: u64,
    /// Negotiated-protocol counts, e.g. `("h2", 12)`.
    pub alpn_distribution: Vec<(String, u64)>,
    pub alpn_strict_mismatches: u64,
    /// Negotiated TLS version counts.
    pub tls_version_distribution: Vec<(String, u64)>,
    /// Handshake failure counts keyed by reason label.
    pub tls_handshake_failures: Vec<(&'static str, u64)>,
    /// In-flight handshake gauge.
    pub handshakes_in_flight: u32,

    pub ktls_send_enabled_connections: u64,
    pub ktls_send_enable_fallbacks: u64,
    pub ktls_send_forced_shutdowns: u64,
    pub ktls_send_bytes: u64,

    /// Live connection states (gauge).
    pub open_connections: usize,
    /// Recycle-cache occupancy (gauge).
    pub cached_connections: usize,
}

impl ServerStats {
    pub(crate) fn bump_alpn(&mut self, protocol: &str) {
        bump_owned(&mut self.alpn_distribution, protocol);
    }

    pub(crate) fn bump_tls_version(&mut self, version: &str) {
        bump_owned(&mut self.tls_version_distribution, version);
    }

    pub(crate) fn bump_handshake_failure(&mut self, reason: &'static str) {
        match self
            .tls_handshake_failures
            .iter_mut()
            .find(|(label, _)| *label == reason)
        {
            Some((_, count)) => *count += 1,
            None => self.tls_handshake_failures.push((reason, 1)),
        }
    }

    #[must_use]
    pub fn handshake_failures(&self, reason: &str) -> u64 {
        self.tls_handshake_failures
            .iter()
            .find(|(label, _)| *label == reason)
            .map_or(0, |(_, count)| *count)
    }

    #[must_use]
    pub fn alpn_selected(&self, protocol: &str) -> u64 {
        self.alpn_distribution
            .iter()
            .find(|(label, _)| label == protocol)
            .map_or(0, |(_, count)| *count)
    }
}

fn bump_owned(distribution: &mut Vec<(String, u64)>, label: &str) {
    match distribution.iter_mut().find(|(have, _)| have == label) {
        Some((_, count)) => *count += 1,
        None => distribution.push((label.to_owned(), 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_bumps_accumulate() {
        let mut stats = ServerStats::default();
        stats.bump_alpn("h2");
        stats.bump_alpn("h2");
        stats.bump_alpn("http/1.1");
        assert_eq!(stats.alpn_selected("h2"), 2);
        assert_eq!(stats.alpn_selected("http/1.1"), 1);
        assert_eq!(stats.alpn_selected("spdy"), 0);
    }

    #[test]
    fn failure_reasons_tracked_by_label() {
        let mut stats = ServerStats::default();
        stats.bump_handshake_failure(crate::tls::reason::ALPN_STRICT_MISMATCH);
        stats.bump_handshake_failure(crate::tls::reason::ALPN_STRICT_MISMATCH);
        assert_eq!(
            stats.handshake_failures(crate::tls::reason::ALPN_STRICT_MISMATCH),
            2
        );
        assert_eq!(stats.handshake_failures("other"), 0);
    }
}
