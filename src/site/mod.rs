//! Site subsystem: certificate groups and their handlers.
//!
//! # Data Flow
//! ```text
//! SiteConfig + HandlerChain
//!     → registry.rs (read PEM files, build CertifiedKey, insert per hostname)
//!     → net::tls::SniResolver reads the live certificate per handshake
//!     → http::tls_server dispatches requests to handler.rs chains
//!     → acme::renewal publishes challenges and swaps certificates
//! ```

pub mod handler;
pub mod registry;

pub use handler::{DispatchError, Exchange, Handler, HandlerChain, TextHandler};
pub use registry::{PendingChallenge, RegistrationError, Site, SiteRegistry};
