//! Background certificate renewal scheduler.
//!
//! Periodically reads each site's live leaf certificate and renews the ones
//! that expire within the configured window.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustls::sign::CertifiedKey;
use tokio::time::MissedTickBehavior;

use super::renewal::CertificateManager;
use crate::config::RenewalConfig;
use crate::lifecycle::Shutdown;
use crate::site::SiteRegistry;

/// Lower bound for the check interval.
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub struct RenewalScheduler {
    manager: Arc<CertificateManager>,
    registry: SiteRegistry,
    check_interval: Duration,
    renew_before: Duration,
}

impl RenewalScheduler {
    pub fn new(manager: Arc<CertificateManager>, registry: SiteRegistry, config: &RenewalConfig) -> Self {
        Self {
            manager,
            registry,
            check_interval: Duration::from_secs(config.check_interval_secs).max(MIN_CHECK_INTERVAL),
            renew_before: Duration::from_secs(u64::from(config.renew_before_days) * 24 * 3600),
        }
    }

    /// Run until shutdown. The first check happens immediately.
    pub async fn run(self, shutdown: Shutdown) {
        tracing::info!(
            check_interval_secs = self.check_interval.as_secs(),
            renew_before_days = self.renew_before.as_secs() / 86_400,
            "Starting certificate renewal scheduler"
        );

        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = shutdown.subscribe();
        if shutdown.is_triggered() {
            return;
        }

        loop {
            tokio::select! {
                _ = interval.tick() => self.check_renewals().await,
                _ = shutdown_rx.recv() => {
                    tracing::info!("Renewal scheduler stopping");
                    break;
                }
            }
        }
    }

    async fn check_renewals(&self) {
        let sites = self.registry.sites();
        tracing::debug!(site_count = sites.len(), "Checking certificates for renewal");

        for site in sites {
            let hostname = site.common_name().to_string();
            match expires_within(&site.certified_key(), self.renew_before, SystemTime::now()) {
                Some(false) => {}
                Some(true) => {
                    tracing::info!(hostname = %hostname, "Certificate needs renewal");
                    if let Err(e) = self.manager.renew(&hostname).await {
                        tracing::error!(hostname = %hostname, error = %e, "Scheduled renewal failed");
                    }
                }
                None => {
                    tracing::warn!(hostname = %hostname, "Unable to read certificate expiry");
                }
            }
        }
    }
}

/// Whether the leaf certificate's `notAfter` falls before `now + window`.
/// `None` when the leaf cannot be parsed.
pub fn expires_within(certified_key: &CertifiedKey, window: Duration, now: SystemTime) -> Option<bool> {
    let leaf = certified_key.end_entity_cert().ok()?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
    let not_after = cert.validity().not_after.timestamp();

    let now = now.duration_since(UNIX_EPOCH).ok()?.as_secs();
    let horizon = now.saturating_add(window.as_secs());
    Some(not_after < i64::try_from(horizon).ok()?)
}
