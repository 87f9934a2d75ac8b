//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Let's Encrypt production directory.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Plaintext and TLS listener sockets.
    pub listener: ListenersConfig,

    /// TLS listener behaviour.
    pub tls: TlsConfig,

    /// ACME issuer settings.
    pub acme: AcmeConfig,

    /// Public-IP probe used to gate the renewal trigger.
    pub trust: TrustConfig,

    /// Background expiry-driven renewal.
    pub renewal: RenewalConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Certificate groups served by this process.
    pub sites: Vec<SiteConfig>,
}

/// Both listener sockets.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenersConfig {
    /// Plaintext listener (ACME challenges, trigger, redirects).
    pub http: ListenerConfig,

    /// TLS listener.
    pub https: ListenerConfig,

    /// Take fd 3 (plaintext) and fd 4 (TLS) when `LISTEN_FDS` is set.
    pub inherit_systemd_sockets: bool,
}

impl Default for ListenersConfig {
    fn default() -> Self {
        Self {
            http: ListenerConfig::with_address("0.0.0.0:80"),
            https: ListenerConfig::with_address("0.0.0.0:443"),
            inherit_systemd_sockets: true,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:80").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl ListenerConfig {
    /// Listener on `address` with the default connection limit.
    pub fn with_address(address: &str) -> Self {
        Self {
            bind_address: address.to_string(),
            ..Self::default()
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:80".to_string(),
            max_connections: 10_000,
        }
    }
}

/// TLS listener behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Upper bound for one application request, in seconds.
    pub request_timeout_secs: u64,

    /// Upper bound for the TLS handshake, in seconds.
    pub handshake_timeout_secs: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 300,
            handshake_timeout_secs: 10,
        }
    }
}

/// ACME issuer settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AcmeConfig {
    /// ACME directory URL.
    pub directory_url: String,

    /// Deadline for one HTTP-01 challenge to become valid, in seconds.
    pub challenge_timeout_secs: u64,

    /// Deadline for the order to become ready/valid, in seconds.
    pub order_timeout_secs: u64,

    /// Base delay between status polls, in milliseconds.
    pub poll_interval_ms: u64,

    /// Cap for the exponential poll delay, in milliseconds.
    pub max_poll_interval_ms: u64,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            challenge_timeout_secs: 120,
            order_timeout_secs: 120,
            poll_interval_ms: 1000,
            max_poll_interval_ms: 8000,
        }
    }
}

/// Public-IP probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Probe the public IP at startup. When off, the trigger is never honored.
    pub enabled: bool,

    /// Address-echo service returning the caller's IP as plain text.
    pub probe_url: String,

    /// Probe request timeout in seconds.
    pub probe_timeout_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_url: "https://ifconfig.co".to_string(),
            probe_timeout_secs: 10,
        }
    }
}

/// Background renewal settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RenewalConfig {
    /// Run the expiry-driven renewal loop.
    pub enabled: bool,

    /// Seconds between certificate expiry checks.
    pub check_interval_secs: u64,

    /// Renew when the certificate expires within this many days.
    pub renew_before_days: u32,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_secs: 12 * 3600,
            renew_before_days: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human-readable or JSON log lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// One certificate group: hostnames sharing a key and certificate.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SiteConfig {
    /// Hostnames in certificate order; the first is the common name.
    pub hostnames: Vec<String>,

    /// PEM private key, rewritten on renewal.
    pub key_path: PathBuf,

    /// PEM certificate chain, rewritten on renewal.
    pub cert_path: PathBuf,

    /// ACME account contact. Sites without one are never renewed.
    #[serde(default)]
    pub acme_email: Option<String>,

    /// Body served by the built-in greeting handler.
    #[serde(default)]
    pub body: Option<String>,
}
