//! Security subsystem.
//!
//! # Responsibilities
//! - Hold the public IP used to gate the renewal trigger (trust.rs)
//! - Normalize peer addresses for comparison
//!
//! # Design Decisions
//! - The trust policy is an explicit, documented IP comparison; there is no
//!   token or credential behind it

pub mod trust;

pub use trust::{peer_address, TrustOracle};
