//! TLS context construction.
//!
//! rustls fixes ALPN policy when a `ServerConfig` is built, so the context
//! pre-builds one config per ALPN outcome: one per protocol in the server's
//! preference list plus a no-ALPN fallback. The acceptor peeks at the
//! ClientHello and the reactor picks the matching config, which keeps the
//! strict/non-strict decision (and its counter) in our hands.
//!
//! Everything lives behind `Arc`s: moving the owning server never
//! invalidates library-internal state.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::{ProducesTickets, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::debug;

use crate::config::{ClientCertMode, KtlsMode, PemItem, TlsConfig};
use crate::error::Error;
use crate::tls::ticket::RotatingTicketer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnChoice {
    /// Index into the server preference list.
    Protocol(usize),
    /// Client offered no ALPN at all.
    NoneOffered,
    /// Client offered ALPN but nothing we speak.
    NoOverlap,
}

pub struct TlsContext {
    base: Arc<ServerConfig>,
    per_protocol: Vec<(Vec<u8>, Arc<ServerConfig>)>,
    strict: bool,
    ktls: KtlsMode,
    client_cert_mode: ClientCertMode,
}

impl TlsContext {
    pub fn build(config: &TlsConfig) -> Result<Self, Error> {
        let certs = load_certs(&config.cert)?;
        let key = load_key(&config.key)?;
        let provider = Arc::new(build_provider(&config.cipher_list)?);
        let versions = protocol_versions(config)?;

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&versions)
            .map_err(|err| Error::new_tls(format!("unsupported protocol versions: {err}")))?;

        let builder = match config.client_cert_mode {
            ClientCertMode::None => builder.with_no_client_auth(),
            mode => {
                let mut roots = RootCertStore::empty();
                for item in &config.trusted_client_certs {
                    for cert in load_certs(item)? {
                        roots
                            .add(cert)
                            .map_err(|err| Error::new_tls(format!("invalid client trust anchor: {err}")))?;
                    }
                }
                let verifier_builder =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
                let verifier_builder = if mode == ClientCertMode::Request {
                    verifier_builder.allow_unauthenticated()
                } else {
                    verifier_builder
                };
                let verifier = verifier_builder
                    .build()
                    .map_err(|err| Error::new_tls(format!("client verifier: {err}")))?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut base = builder
            .with_single_cert(certs, key)
            .map_err(|err| Error::new_tls(format!("certificate/key mismatch: {err}")))?;

        if config.tickets.enabled {
            let ticketer: Arc<dyn ProducesTickets> =
                Arc::new(RotatingTicketer::from_config(&config.tickets)?);
            base.ticketer = ticketer;
        }
        base.enable_secret_extraction = config.ktls != KtlsMode::Disabled;

        let base = Arc::new(base);
        let per_protocol = config
            .alpn
            .iter()
            .map(|protocol| {
                let mut variant = (*base).clone();
                variant.alpn_protocols = vec![protocol.as_bytes().to_vec()];
                (protocol.as_bytes().to_vec(), Arc::new(variant))
            })
            .collect();

        Ok(Self {
            base,
            per_protocol,
            strict: config.alpn_strict,
            ktls: config.ktls,
            client_cert_mode: config.client_cert_mode,
        })
    }

    /// Pick the server's most-preferred protocol present in the client's
    /// offer list.
    pub fn select_alpn<'a>(
        &self,
        mut offers: impl Iterator<Item = &'a [u8]> + Clone,
    ) -> AlpnChoice {
        if offers.clone().next().is_none() {
            return AlpnChoice::NoneOffered;
        }
        if self.per_protocol.is_empty() {
            return AlpnChoice::NoneOffered;
        }
        for (idx, (protocol, _)) in self.per_protocol.iter().enumerate() {
            if offers.clone().any(|offer| offer == protocol.as_slice()) {
                return AlpnChoice::Protocol(idx);
            }
        }
        let _ = offers.next();
        AlpnChoice::NoOverlap
    }

    pub fn config_for(&self, choice: AlpnChoice) -> Arc<ServerConfig> {
        match choice {
            AlpnChoice::Protocol(idx) => self.per_protocol[idx].1.clone(),
            AlpnChoice::NoneOffered | AlpnChoice::NoOverlap => self.base.clone(),
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn ktls(&self) -> KtlsMode {
        self.ktls
    }

    pub fn requests_client_cert(&self) -> bool {
        self.client_cert_mode != ClientCertMode::None
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("alpn_protocols", &self.per_protocol.len())
            .field("strict", &self.strict)
            .field("ktls", &self.ktls)
            .finish()
    }
}

fn load_certs(item: &PemItem) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs: Result<Vec<_>, _> = match item {
        PemItem::Path(path) => CertificateDer::pem_file_iter(path)
            .map_err(|err| Error::new_tls(format!("reading certificate pem: {err}")))?
            .collect(),
        PemItem::Memory(bytes) => CertificateDer::pem_slice_iter(bytes).collect(),
    };
    let certs = certs.map_err(|err| Error::new_tls(format!("parsing certificate pem: {err}")))?;
    if certs.is_empty() {
        return Err(Error::new_tls("certificate pem contains no certificates"));
    }
    Ok(certs)
}

fn load_key(item: &PemItem) -> Result<PrivateKeyDer<'static>, Error> {
    match item {
        PemItem::Path(path) => PrivateKeyDer::from_pem_file(path),
        PemItem::Memory(bytes) => PrivateKeyDer::from_pem_slice(bytes),
    }
    .map_err(|err| Error::new_tls(format!("parsing private key pem: {err}")))
}

fn build_provider(cipher_list: &[String]) -> Result<CryptoProvider, Error> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    if cipher_list.is_empty() {
        return Ok(provider);
    }
    for name in cipher_list {
        if !provider
            .cipher_suites
            .iter()
            .any(|suite| suite_name(suite) == *name)
        {
            return Err(Error::new_tls(format!("unknown cipher suite {name:?}")));
        }
    }
    provider
        .cipher_suites
        .retain(|suite| cipher_list.iter().any(|name| suite_name(suite) == *name));
    debug!(suites = provider.cipher_suites.len(), "cipher list applied");
    Ok(provider)
}

pub(crate) fn suite_name(suite: &rustls::SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

fn protocol_versions(
    config: &TlsConfig,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, Error> {
    let min = version_rank(config.min_version.as_deref(), 2)?;
    let max = version_rank(config.max_version.as_deref(), 3)?;
    if min > max {
        return Err(Error::new_tls("tls min_version above max_version"));
    }
    let mut versions = Vec::with_capacity(2);
    if min <= 2 && max >= 2 {
        versions.push(&rustls::version::TLS12);
    }
    if max >= 3 {
        versions.push(&rustls::version::TLS13);
    }
    Ok(versions)
}

fn version_rank(version: Option<&str>, default: u8) -> Result<u8, Error> {
    match version {
        None => Ok(default),
        Some("1.2") => Ok(2),
        Some("1.3") => Ok(3),
        Some(other) => Err(Error::new_tls(format!(
            "unsupported tls protocol version {other:?}"
        ))),
    }
}

/// Protocol version label as reported in stats and request TLS info.
pub(crate) fn version_label(version: rustls::ProtocolVersion) -> &'static str {
    match version {
        rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2",
        rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3",
        _ => "TLS-unknown",
    }
}

/// RFC 2253 subject of a client certificate.
pub(crate) fn peer_subject(der: &CertificateDer<'_>) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).ok()?;
    Some(cert.subject().to_string())
}
