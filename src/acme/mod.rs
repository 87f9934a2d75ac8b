//! ACME certificate lifecycle subsystem.
//!
//! # Data Flow
//! ```text
//! Trigger (plaintext /update_certificate, scheduler.rs, Server::renew)
//!     → renewal.rs (per-site state machine, holds the site's renewal lock)
//!     → csr.rs (fresh key + CSR)
//!     → issuer.rs traits, implemented by letsencrypt.rs
//!     → site registry (pending challenge, then the new certificate)
//! ```
//!
//! # Design Decisions
//! - Only HTTP-01 is supported
//! - The protocol sits behind traits so the state machine can be exercised
//!   without a live authority

pub mod csr;
pub mod error;
pub mod issuer;
pub mod letsencrypt;
pub mod renewal;
pub mod scheduler;

pub use error::{IssuerError, RenewalError};
pub use issuer::{
    AcmeAccount, AcmeIssuer, AcmeOrder, Authorization, AuthorizationState, Http01Challenge,
};
pub use letsencrypt::LetsEncryptIssuer;
pub use renewal::{CertificateManager, RenewalSettings, RenewalState};
pub use scheduler::RenewalScheduler;
