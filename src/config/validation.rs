//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every hostname belongs to exactly one site
//! - Validate value ranges (timeouts > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::ServerConfig;
use crate::site::registry::normalize_hostname;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    NoSites,
    EmptyHostnames { site: usize },
    DuplicateHostname(String),
    InvalidAddress { field: &'static str, value: String },
    InvalidUrl { field: &'static str, value: String },
    ZeroValue(&'static str),
    PollIntervalRange { base_ms: u64, max_ms: u64 },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::NoSites => write!(f, "at least one [[sites]] entry is required"),
            ValidationError::EmptyHostnames { site } => {
                write!(f, "sites[{}] has no hostnames", site)
            }
            ValidationError::DuplicateHostname(name) => {
                write!(f, "hostname {} is listed more than once", name)
            }
            ValidationError::InvalidAddress { field, value } => {
                write!(f, "{} is not a socket address: {}", field, value)
            }
            ValidationError::InvalidUrl { field, value } => {
                write!(f, "{} is not a valid URL: {}", field, value)
            }
            ValidationError::ZeroValue(field) => write!(f, "{} must be greater than zero", field),
            ValidationError::PollIntervalRange { base_ms, max_ms } => write!(
                f,
                "acme.max_poll_interval_ms ({}) is below acme.poll_interval_ms ({})",
                max_ms, base_ms
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Check semantic constraints serde cannot express.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.sites.is_empty() {
        errors.push(ValidationError::NoSites);
    }

    let mut seen = HashSet::new();
    for (index, site) in config.sites.iter().enumerate() {
        if site.hostnames.is_empty() {
            errors.push(ValidationError::EmptyHostnames { site: index });
        }
        for hostname in &site.hostnames {
            if !seen.insert(normalize_hostname(hostname)) {
                errors.push(ValidationError::DuplicateHostname(hostname.clone()));
            }
        }
    }

    let addresses = [
        ("listener.http.bind_address", &config.listener.http.bind_address),
        ("listener.https.bind_address", &config.listener.https.bind_address),
    ];
    for (field, value) in addresses {
        if value.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidAddress { field, value: value.clone() });
        }
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    let urls = [
        ("acme.directory_url", &config.acme.directory_url),
        ("trust.probe_url", &config.trust.probe_url),
    ];
    for (field, value) in urls {
        if url::Url::parse(value).is_err() {
            errors.push(ValidationError::InvalidUrl { field, value: value.clone() });
        }
    }

    let positive = [
        ("listener.http.max_connections", config.listener.http.max_connections as u64),
        ("listener.https.max_connections", config.listener.https.max_connections as u64),
        ("tls.request_timeout_secs", config.tls.request_timeout_secs),
        ("tls.handshake_timeout_secs", config.tls.handshake_timeout_secs),
        ("acme.challenge_timeout_secs", config.acme.challenge_timeout_secs),
        ("acme.order_timeout_secs", config.acme.order_timeout_secs),
        ("acme.poll_interval_ms", config.acme.poll_interval_ms),
        ("acme.max_poll_interval_ms", config.acme.max_poll_interval_ms),
        ("trust.probe_timeout_secs", config.trust.probe_timeout_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::ZeroValue(field));
        }
    }

    if config.acme.max_poll_interval_ms < config.acme.poll_interval_ms {
        errors.push(ValidationError::PollIntervalRange {
            base_ms: config.acme.poll_interval_ms,
            max_ms: config.acme.max_poll_interval_ms,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
