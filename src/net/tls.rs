//! TLS configuration, certificate loading and SNI resolution.
//!
//! # Responsibilities
//! - Parse PEM key/certificate pairs into rustls `CertifiedKey`s
//! - Reject pairs whose key does not match the leaf certificate
//! - Resolve the certificate for each handshake from the site registry
//!
//! # Design Decisions
//! - Unknown or missing SNI aborts the handshake; there is no default certificate
//! - The resolver reads the live `ArcSwap` on every handshake, so a renewal
//!   is visible to the next handshake without rebuilding the `ServerConfig`

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::version::{TLS12, TLS13};

use crate::observability::metrics;
use crate::site::SiteRegistry;

/// Error type for TLS material.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("no certificate found in {0}")]
    NoCertificate(String),
    #[error("failed to parse certificate {path}: {source}")]
    Certificate {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("failed to parse private key {path}: {source}")]
    PrivateKey {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported private key: {0}")]
    UnsupportedKey(rustls::Error),
    #[error("private key does not match certificate: {0}")]
    KeyMismatch(rustls::Error),
    #[error("failed to build TLS config: {0}")]
    Config(rustls::Error),
}

/// Crypto provider used for every server-side TLS object.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Install the process-wide default provider.
///
/// Needed by libraries that build their own rustls configs (the ACME client).
/// Calling it twice is harmless.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Build a `CertifiedKey` from PEM encoded certificate chain and private key.
///
/// `origin` names the material in error messages (usually the file path).
pub fn certified_key_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
    origin: &Path,
) -> Result<CertifiedKey, TlsError> {
    let origin = origin.display().to_string();

    let mut cert_reader = cert_pem;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Certificate { path: origin.clone(), source })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(origin));
    }

    let mut key_reader = key_pem;
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|source| TlsError::PrivateKey { path: origin.clone(), source })?
        .ok_or_else(|| TlsError::NoPrivateKey(origin.clone()))?;

    let signing_key = crypto_provider()
        .key_provider
        .load_private_key(key)
        .map_err(TlsError::UnsupportedKey)?;

    let certified = CertifiedKey::new(certs, signing_key);
    certified.keys_match().map_err(TlsError::KeyMismatch)?;
    Ok(certified)
}

/// SNI-aware certificate resolver backed by the site registry.
#[derive(Debug)]
pub struct SniResolver {
    registry: SiteRegistry,
}

impl SniResolver {
    pub fn new(registry: SiteRegistry) -> Self {
        Self { registry }
    }

    /// Resolve the certificate for a server name, if any site owns it.
    pub fn resolve_name(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = server_name else {
            tracing::debug!("Handshake without SNI rejected");
            metrics::record_handshake_rejected("missing_sni");
            return None;
        };

        match self.registry.get(name) {
            Some(site) => Some(site.certified_key()),
            None => {
                tracing::debug!(server_name = %name, "Handshake for unknown hostname rejected");
                metrics::record_handshake_rejected("unknown_host");
                None
            }
        }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.resolve_name(client_hello.server_name())
    }
}

/// Build the listener's rustls config: TLS 1.2+, h2/http1.1 ALPN, SNI resolution.
pub fn server_config(registry: SiteRegistry) -> Result<rustls::ServerConfig, TlsError> {
    let mut config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&TLS12, &TLS13])
        .map_err(TlsError::Config)?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(registry)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(hostnames: &[&str]) -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let params =
            rcgen::CertificateParams::new(hostnames.iter().map(|h| h.to_string()).collect::<Vec<_>>())
                .unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn loads_matching_pair() {
        let (cert, key) = self_signed(&["a.example"]);
        let certified =
            certified_key_from_pem(cert.as_bytes(), key.as_bytes(), Path::new("a.pem")).unwrap();
        assert_eq!(certified.cert.len(), 1);
    }

    #[test]
    fn rejects_mismatched_pair() {
        let (cert, _) = self_signed(&["a.example"]);
        let (_, other_key) = self_signed(&["a.example"]);
        let err = certified_key_from_pem(cert.as_bytes(), other_key.as_bytes(), Path::new("a.pem"))
            .unwrap_err();
        assert!(matches!(err, TlsError::KeyMismatch(_)));
    }

    #[test]
    fn rejects_empty_material() {
        let (_, key) = self_signed(&["a.example"]);
        let err = certified_key_from_pem(b"", key.as_bytes(), Path::new("a.pem")).unwrap_err();
        assert!(matches!(err, TlsError::NoCertificate(_)));

        let (cert, _) = self_signed(&["a.example"]);
        let err = certified_key_from_pem(cert.as_bytes(), b"", Path::new("a.pem")).unwrap_err();
        assert!(matches!(err, TlsError::NoPrivateKey(_)));
    }

    #[test]
    fn resolver_refuses_unknown_and_missing_names() {
        let resolver = SniResolver::new(SiteRegistry::new());
        assert!(resolver.resolve_name(None).is_none());
        assert!(resolver.resolve_name(Some("nobody.example")).is_none());
    }
}
