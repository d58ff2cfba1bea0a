//! TLS configuration for both sides of an intercepted tunnel.
//!
//! This module provides:
//! - A certificate resolver backed by the [`CertificateAuthority`] leaf cache
//! - The TLS acceptor for the child's connection (proxy as server)
//! - The TLS connector for the destination (proxy as client)
//!
//! # Critical ALPN Note
//!
//! Both sides are pinned to HTTP/1.1 via ALPN. The tunnel copies decrypted
//! bytes between the two sessions, so both must speak the same protocol; if
//! the child negotiated H2 while the destination picked HTTP/1.1 (or the
//! reverse) the streams would be unintelligible to each other.

use super::error::ProxyError;
use crate::ca::CertificateAuthority;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, trace, warn};

const HTTP11: &[u8] = b"http/1.1";

/// Resolves the leaf certificate for an intercepted tunnel.
///
/// Uses the SNI from the ClientHello, falling back to the CONNECT host for
/// clients that send none (e.g. when connecting by IP address).
pub struct LeafResolver {
    ca: Arc<CertificateAuthority>,
    connect_host: String,
}

impl LeafResolver {
    /// Resolver for a tunnel opened with `CONNECT connect_host:port`.
    pub fn new(ca: Arc<CertificateAuthority>, connect_host: impl Into<String>) -> Self {
        Self {
            ca,
            connect_host: connect_host.into(),
        }
    }
}

impl ResolvesServerCert for LeafResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello
            .server_name()
            .unwrap_or(self.connect_host.as_str());
        trace!("Resolving leaf certificate for {}", host);

        // Returning None aborts the handshake; the tunnel never falls back to
        // plaintext.
        match self.ca.issue_leaf(host) {
            Ok(leaf) => Some(leaf.certified_key.clone()),
            Err(e) => {
                error!("Failed to issue certificate for {}: {}", host, e);
                None
            }
        }
    }
}

impl std::fmt::Debug for LeafResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafResolver")
            .field("connect_host", &self.connect_host)
            .field("issued", &self.ca.issued_count())
            .finish()
    }
}

/// Create the TLS acceptor presented to the child for `connect_host`.
pub fn client_acceptor(ca: Arc<CertificateAuthority>, connect_host: &str) -> TlsAcceptor {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(LeafResolver::new(ca, connect_host)));

    config.alpn_protocols = vec![HTTP11.to_vec()];

    TlsAcceptor::from(Arc::new(config))
}

/// Create the TLS connector used towards destinations.
///
/// Verifies against the system root store unless `insecure` is set. An empty
/// system store is not fatal here: every verified handshake will then fail
/// per connection, which is reported to the child as a gateway error.
pub fn destination_connector(insecure: bool) -> TlsConnector {
    let mut config = if insecure {
        warn!("Destination TLS certificate verification is disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier::new()))
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .with_root_certificates(native_root_store())
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![HTTP11.to_vec()];

    TlsConnector::from(Arc::new(config))
}

fn native_root_store() -> rustls::RootCertStore {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();
    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }
    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        warn!("No system root certificates found; verified destinations will fail");
    } else {
        debug!("Loaded {} root certificates", root_store.len());
    }

    root_store
}

/// Convert a host to a `ServerName` for the destination handshake.
pub fn server_name(host: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", host)))
}

/// Accepts any destination certificate. Only used with `--insecure`.
#[derive(Debug)]
struct NoVerifier {
    schemes: Vec<SignatureScheme>,
}

impl NoVerifier {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
