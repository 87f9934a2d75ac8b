//! Trust oracle: this process's believed public IP.
//!
//! The renewal trigger on the plaintext listener is only honored for
//! requests whose peer address equals the public IP learned at startup, and
//! handlers receive the same comparison as their `local` flag. This is a weak
//! control: anyone able to originate traffic from that address passes it.
//!
//! # Design Decisions
//! - Resolved at most once; never retried
//! - Until resolved, nothing is trusted

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::TrustConfig;

/// Shared holder of the probed public IP.
#[derive(Debug, Clone, Default)]
pub struct TrustOracle {
    ip: Arc<OnceLock<String>>,
}

impl TrustOracle {
    /// An oracle that has not learned its IP yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// An oracle that already knows its IP.
    pub fn resolved(ip: impl Into<String>) -> Self {
        let oracle = Self::new();
        oracle.set(ip);
        oracle
    }

    /// Record the public IP. Later calls are ignored.
    pub fn set(&self, ip: impl Into<String>) {
        let ip = ip.into().trim().to_string();
        if ip.is_empty() {
            return;
        }
        if self.ip.set(ip).is_err() {
            tracing::debug!("Public IP already resolved, ignoring update");
        }
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.get().map(String::as_str)
    }

    /// Exact string comparison against the resolved IP.
    pub fn is_trusted(&self, address: &str) -> bool {
        self.ip().is_some_and(|ip| ip == address)
    }
}

/// Render a peer IP the way it is compared and shown to handlers.
///
/// IPv4 peers accepted on a dual-stack socket arrive as `::ffff:a.b.c.d`;
/// the prefix is dropped.
pub fn peer_address(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

/// Fire-and-forget lookup of the public IP.
pub fn spawn_probe(oracle: TrustOracle, config: &TrustConfig) -> Option<JoinHandle<()>> {
    if !config.enabled {
        tracing::info!("Public IP probe disabled; renewal trigger will never be honored");
        return None;
    }

    let url = config.probe_url.clone();
    let timeout = Duration::from_secs(config.probe_timeout_secs);

    Some(tokio::spawn(async move {
        match probe(&url, timeout).await {
            Ok(ip) => {
                tracing::info!(public_ip = %ip, "Public IP resolved");
                oracle.set(ip);
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Public IP probe failed");
            }
        }
    }))
}

async fn probe(url: &str, timeout: Duration) -> Result<String, reqwest::Error> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let body = client
        .get(url)
        .header(reqwest::header::ACCEPT, "*/*")
        .header(reqwest::header::USER_AGENT, "curl/7.52.1")
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(body.trim().to_string())
}
