//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Service manager fds or configured addresses
//!     → listener.rs (socket acquisition, bounded accept loop)
//!     → tls.rs (SNI certificate selection, rustls server config)
//!     → connection.rs (lifecycle tracking for graceful shutdown)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - A handshake for an unregistered name is aborted, never answered with
//!   some other site's certificate

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionTracker};
pub use listener::{BoundSockets, Listener, ListenerError};
pub use tls::{SniResolver, TlsError};
