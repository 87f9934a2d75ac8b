//! Hostname → site mapping.
//!
//! # Responsibilities
//! - Own every `Site` record for the lifetime of the process
//! - Map each hostname of a certificate group to the same `Arc<Site>`
//! - Hold the live certificate, the pending HTTP-01 challenge and the
//!   per-site renewal lock
//!
//! # Design Decisions
//! - Hostnames are compared ASCII-lowercased; no wildcard matching
//! - Entries are never removed once registration succeeds
//! - Registration inserts hostname by hostname and rolls back on collision,
//!   so concurrent registrations of disjoint groups never block each other

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustls::sign::CertifiedKey;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::SiteConfig;
use crate::net::tls::{certified_key_from_pem, TlsError};
use crate::site::handler::HandlerChain;

/// Error type for site registration.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("site has no hostnames")]
    EmptyHostnames,
    #[error("hostname {0} is already registered")]
    DuplicateHostname(String),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// An HTTP-01 challenge currently being validated by the issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChallenge {
    pub hostname: String,
    pub token: String,
    pub key_authorization: String,
}

/// A certificate group: hostnames sharing one key and certificate.
pub struct Site {
    hostnames: Vec<String>,
    key_path: PathBuf,
    cert_path: PathBuf,
    acme_email: Option<String>,
    certified_key: ArcSwap<CertifiedKey>,
    pending: ArcSwapOption<PendingChallenge>,
    renewal: Mutex<()>,
    handlers: HandlerChain,
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("hostnames", &self.hostnames)
            .field("key_path", &self.key_path)
            .field("cert_path", &self.cert_path)
            .field("acme_email", &self.acme_email)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl Site {
    /// Create a site from its configuration and already loaded TLS material.
    pub fn new(config: &SiteConfig, certified_key: CertifiedKey, handlers: HandlerChain) -> Self {
        Self {
            hostnames: config.hostnames.iter().map(|h| normalize_hostname(h)).collect(),
            key_path: config.key_path.clone(),
            cert_path: config.cert_path.clone(),
            acme_email: config.acme_email.clone().filter(|e| !e.trim().is_empty()),
            certified_key: ArcSwap::from_pointee(certified_key),
            pending: ArcSwapOption::empty(),
            renewal: Mutex::new(()),
            handlers,
        }
    }

    /// Read the key and certificate files and build the site.
    pub async fn load(config: &SiteConfig, handlers: HandlerChain) -> Result<Self, RegistrationError> {
        if config.hostnames.is_empty() {
            return Err(RegistrationError::EmptyHostnames);
        }
        let key_pem = read(&config.key_path).await?;
        let cert_pem = read(&config.cert_path).await?;
        let certified_key = certified_key_from_pem(&cert_pem, &key_pem, &config.cert_path)?;
        Ok(Self::new(config, certified_key, handlers))
    }

    /// Hostnames in certificate order.
    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    /// The certificate's common name.
    pub fn common_name(&self) -> &str {
        &self.hostnames[0]
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn acme_email(&self) -> Option<&str> {
        self.acme_email.as_deref()
    }

    pub fn handlers(&self) -> &HandlerChain {
        &self.handlers
    }

    /// The certificate currently presented to clients.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified_key.load_full()
    }

    /// Atomically replace the certificate for every hostname of the group.
    pub(crate) fn replace_certified_key(&self, certified_key: Arc<CertifiedKey>) {
        self.certified_key.store(certified_key);
    }

    /// Key authorization to serve for `token` on `hostname`, if it is pending.
    pub fn challenge_response(&self, hostname: &str, token: &str) -> Option<String> {
        self.pending
            .load_full()
            .filter(|p| p.token == token && p.hostname.eq_ignore_ascii_case(hostname))
            .map(|p| p.key_authorization.clone())
    }

    /// The challenge currently published, if any.
    pub fn pending_challenge(&self) -> Option<PendingChallenge> {
        self.pending.load_full().map(|p| (*p).clone())
    }

    /// Publish a challenge until the returned guard is dropped.
    pub(crate) fn publish_challenge(&self, challenge: PendingChallenge) -> ChallengeGuard<'_> {
        tracing::debug!(
            hostname = %challenge.hostname,
            token = %challenge.token,
            "Publishing HTTP-01 challenge"
        );
        self.pending.store(Some(Arc::new(challenge)));
        ChallengeGuard { site: self }
    }

    /// Serialize renewals of this site.
    pub(crate) async fn lock_renewal(&self) -> MutexGuard<'_, ()> {
        self.renewal.lock().await
    }
}

/// Clears the site's pending challenge when dropped, on every exit path.
#[must_use]
pub(crate) struct ChallengeGuard<'a> {
    site: &'a Site,
}

impl Drop for ChallengeGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.site.pending.swap(None) {
            tracing::debug!(
                hostname = %previous.hostname,
                token = %previous.token,
                "Cleared HTTP-01 challenge"
            );
        }
    }
}

/// Process-wide hostname → site mapping.
#[derive(Clone, Default)]
pub struct SiteRegistry {
    sites: Arc<DashMap<String, Arc<Site>>>,
}

impl std::fmt::Debug for SiteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteRegistry")
            .field("hostnames", &self.sites.len())
            .finish()
    }
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a site from disk and insert it under each of its hostnames.
    pub async fn register(
        &self,
        config: &SiteConfig,
        handlers: HandlerChain,
    ) -> Result<Arc<Site>, RegistrationError> {
        let site = Arc::new(Site::load(config, handlers).await?);
        self.insert(Arc::clone(&site))?;
        tracing::info!(
            hostnames = ?site.hostnames(),
            cert_path = %site.cert_path().display(),
            "Site registered"
        );
        Ok(site)
    }

    /// Insert an already built site under each of its hostnames.
    ///
    /// Fails without leaving any of the site's entries behind if one of its
    /// hostnames is taken.
    pub fn insert(&self, site: Arc<Site>) -> Result<(), RegistrationError> {
        if site.hostnames().is_empty() {
            return Err(RegistrationError::EmptyHostnames);
        }

        for (index, hostname) in site.hostnames().iter().enumerate() {
            // The entry holds its shard lock; release it before rolling back.
            let inserted = match self.sites.entry(hostname.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&site));
                    true
                }
                Entry::Occupied(_) => false,
            };
            if !inserted {
                for earlier in &site.hostnames()[..index] {
                    self.sites.remove_if(earlier, |_, existing| Arc::ptr_eq(existing, &site));
                }
                return Err(RegistrationError::DuplicateHostname(hostname.clone()));
            }
        }
        Ok(())
    }

    /// Exact hostname lookup.
    pub fn get(&self, hostname: &str) -> Option<Arc<Site>> {
        self.sites
            .get(normalize_hostname(hostname).as_str())
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.get(hostname).is_some()
    }

    /// Every registered hostname.
    pub fn hostnames(&self) -> BTreeSet<String> {
        self.sites.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Each distinct site once, in no particular order.
    pub fn sites(&self) -> Vec<Arc<Site>> {
        let mut sites: Vec<Arc<Site>> = Vec::new();
        for entry in self.sites.iter() {
            if !sites.iter().any(|s| Arc::ptr_eq(s, entry.value())) {
                sites.push(Arc::clone(entry.value()));
            }
        }
        sites
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// Lowercase and drop a trailing root dot.
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}

async fn read(path: &Path) -> Result<Vec<u8>, RegistrationError> {
    tokio::fs::read(path).await.map_err(|source| RegistrationError::Io {
        path: path.to_path_buf(),
        source,
    })
}
