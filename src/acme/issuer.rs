//! The ACME protocol seam.
//!
//! The renewal state machine only talks to these traits. `letsencrypt.rs`
//! implements them over `instant-acme`; tests script them in memory.

use async_trait::async_trait;

use super::error::IssuerError;

/// Status of one authorization, reduced to what the renewal flow acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationState {
    Pending,
    Valid,
    Invalid,
    /// Deactivated, expired or revoked.
    Unusable,
}

/// An HTTP-01 challenge offered by the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http01Challenge {
    pub token: String,
    pub url: String,
}

/// One authorization of an order.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub hostname: String,
    pub state: AuthorizationState,
    /// `None` when the authority offered no HTTP-01 challenge.
    pub http01: Option<Http01Challenge>,
}

/// Entry point: a configured ACME directory.
#[async_trait]
pub trait AcmeIssuer: Send + Sync + 'static {
    /// Register a new account with a fresh account key.
    async fn create_account(&self, email: &str) -> Result<Box<dyn AcmeAccount>, IssuerError>;
}

#[async_trait]
pub trait AcmeAccount: Send + Sync {
    /// Open an order for DNS identifiers, in the given order.
    async fn new_order(&self, hostnames: &[String]) -> Result<Box<dyn AcmeOrder>, IssuerError>;
}

#[async_trait]
pub trait AcmeOrder: Send {
    async fn authorizations(&mut self) -> Result<Vec<Authorization>, IssuerError>;

    /// Body the authority expects at `/.well-known/acme-challenge/<token>`.
    fn key_authorization(&self, challenge: &Http01Challenge) -> Result<String, IssuerError>;

    /// Tell the authority the challenge response is being served.
    async fn set_challenge_ready(&mut self, challenge: &Http01Challenge) -> Result<(), IssuerError>;

    /// Re-read the status of the authorization for `hostname`.
    async fn authorization_status(&mut self, hostname: &str) -> Result<AuthorizationState, IssuerError>;

    /// Submit the CSR once the order is ready.
    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), IssuerError>;

    /// The PEM chain, or `None` while the authority is still issuing.
    async fn certificate(&mut self) -> Result<Option<String>, IssuerError>;
}
