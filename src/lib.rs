//! Multi-hostname TLS termination with ACME HTTP-01 certificate renewal.

pub mod acme;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod security;
pub mod site;

pub use config::ServerConfig;
pub use http::Server;
pub use lifecycle::Shutdown;
pub use site::{Exchange, Handler, HandlerChain};
