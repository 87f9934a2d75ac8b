//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Polling an external authority (ACME order and challenge status):
//!     → backoff.rs (exponential delay with jitter)
//!     → deadline reached: caller reports a timeout
//! ```
//!
//! # Design Decisions
//! - Every poll loop has a deadline; nothing waits forever

pub mod backoff;

pub use backoff::{calculate_backoff, Backoff};
