//! Error types for certificate issuance.

use std::path::PathBuf;

use crate::net::TlsError;

/// Failure reported by an ACME issuer implementation.
#[derive(Debug, thiserror::Error)]
pub enum IssuerError {
    #[error("ACME protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),
    #[error("rejected by the authority: {0}")]
    Rejected(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("{0}")]
    Other(String),
}

/// A renewal failure, named after the stage that failed.
///
/// None of these leave the live certificate, the files on disk or the
/// pending challenge changed.
#[derive(Debug, thiserror::Error)]
pub enum RenewalError {
    #[error("failed to generate certificate key: {0}")]
    KeyGeneration(#[source] rcgen::Error),
    #[error("failed to create ACME account: {0}")]
    Account(#[source] IssuerError),
    #[error("failed to create order: {0}")]
    Order(#[source] IssuerError),
    #[error("failed to fetch authorizations: {0}")]
    Authorizations(#[source] IssuerError),
    #[error("no http-01 challenge offered for {hostname}")]
    MissingHttp01Challenge { hostname: String },
    #[error("challenge for {hostname} failed: {source}")]
    Challenge {
        hostname: String,
        #[source]
        source: IssuerError,
    },
    #[error("challenge for {hostname} was not validated in time")]
    ChallengeTimeout { hostname: String },
    #[error("failed to finalize order: {0}")]
    Finalize(#[source] IssuerError),
    #[error("failed to download certificate: {0}")]
    Certificate(#[source] IssuerError),
    #[error("certificate was not issued in time")]
    CertificateTimeout,
    #[error("issued certificate is unusable: {0}")]
    Publish(#[source] TlsError),
    #[error("failed to write {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RenewalError {
    /// Short stage label for metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            RenewalError::KeyGeneration(_) => "key_generation",
            RenewalError::Account(_) => "account",
            RenewalError::Order(_) => "order",
            RenewalError::Authorizations(_) => "authorizations",
            RenewalError::MissingHttp01Challenge { .. } => "missing_http01",
            RenewalError::Challenge { .. } => "challenge",
            RenewalError::ChallengeTimeout { .. } => "challenge_timeout",
            RenewalError::Finalize(_) => "finalize",
            RenewalError::Certificate(_) => "certificate",
            RenewalError::CertificateTimeout => "certificate_timeout",
            RenewalError::Publish(_) => "publish",
            RenewalError::Persist { .. } => "persist",
        }
    }
}
