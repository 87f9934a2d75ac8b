//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Plaintext TCP connection
//!     → plaintext.rs (challenge / trigger / redirect)
//!
//! TLS connection
//!     → tls_server.rs (SNI acceptor, dispatch to the site's handlers)
//!
//! server.rs ties both listeners to the shared registry and exposes the
//! facade handlers see as `Exchange::server`.
//! ```

pub mod plaintext;
pub mod server;
pub mod tls_server;

pub use plaintext::{respond, https_location, Rejected, CHALLENGE_PREFIX, UPDATE_CERTIFICATE_PATH};
pub use server::{ServeError, Server};
pub use tls_server::{SniAcceptor, TlsSession};
