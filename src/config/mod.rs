//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → handed to the binary, which opens sockets and registers sites
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; certificate material is the only
//!   state that changes at runtime and it lives in the site registry
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::ServerConfig;
pub use schema::ListenerConfig;
pub use schema::ListenersConfig;
pub use schema::SiteConfig;
pub use schema::{
    AcmeConfig, LogFormat, ObservabilityConfig, RenewalConfig, TlsConfig, TrustConfig,
    LETS_ENCRYPT_PRODUCTION,
};
