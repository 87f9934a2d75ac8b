//! Certificate lifecycle manager.
//!
//! # Responsibilities
//! - Drive one ACME HTTP-01 issuance for a site, stage by stage
//! - Publish each challenge on the site while its authorization is validated
//! - Persist the new pair and swap it into the live site
//!
//! # Design Decisions
//! - A site's renewal mutex is held for the whole run; a second caller waits
//!   and then runs its own complete session
//! - Nothing observable changes before Publish: a failure at any earlier
//!   stage leaves the live certificate, the files and the pending challenge
//!   as they were
//! - Every wait on the authority is bounded by a deadline
//!
//! # Data Flow
//! ```text
//! Start → AccountCreated → OrderCreated → AuthorizationsFetched
//!       → ChallengeLoop → Finalize → CertificateReady → Publish → Idle
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;
use uuid::Uuid;

use super::csr::{self, CertificateRequest};
use super::error::{IssuerError, RenewalError};
use super::issuer::{AcmeIssuer, AcmeOrder, Authorization, AuthorizationState};
use crate::config::AcmeConfig;
use crate::net::tls::certified_key_from_pem;
use crate::observability::metrics;
use crate::resilience::Backoff;
use crate::site::{PendingChallenge, Site, SiteRegistry};

/// Stage of a renewal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    Start,
    AccountCreated,
    OrderCreated,
    AuthorizationsFetched,
    ChallengeLoop,
    Finalize,
    CertificateReady,
    Publish,
    Idle,
}

/// Deadlines and poll pacing for a renewal.
#[derive(Debug, Clone)]
pub struct RenewalSettings {
    pub challenge_timeout: Duration,
    pub order_timeout: Duration,
    pub poll_base_ms: u64,
    pub poll_max_ms: u64,
}

impl From<&AcmeConfig> for RenewalSettings {
    fn from(config: &AcmeConfig) -> Self {
        Self {
            challenge_timeout: Duration::from_secs(config.challenge_timeout_secs),
            order_timeout: Duration::from_secs(config.order_timeout_secs),
            poll_base_ms: config.poll_interval_ms,
            poll_max_ms: config.max_poll_interval_ms,
        }
    }
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self::from(&AcmeConfig::default())
    }
}

/// Runs renewals for the sites of one registry.
pub struct CertificateManager {
    registry: SiteRegistry,
    issuer: Arc<dyn AcmeIssuer>,
    settings: RenewalSettings,
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("sites", &self.registry.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CertificateManager {
    pub fn new(registry: SiteRegistry, issuer: Arc<dyn AcmeIssuer>, settings: RenewalSettings) -> Self {
        Self {
            registry,
            issuer,
            settings,
        }
    }

    /// Obtain and install a new certificate for the site owning `hostname`.
    ///
    /// Succeeds without doing anything when no site owns the hostname or the
    /// site has no ACME contact.
    pub async fn renew(&self, hostname: &str) -> Result<(), RenewalError> {
        let Some(site) = self.registry.get(hostname) else {
            tracing::debug!(hostname = %hostname, "Renewal requested for unknown hostname");
            return Ok(());
        };
        let Some(email) = site.acme_email().map(str::to_string) else {
            tracing::debug!(hostname = %hostname, "Site has no ACME contact, skipping renewal");
            return Ok(());
        };

        let _serialized = site.lock_renewal().await;

        let session = RenewalSession::new(&site, &email, &self.settings);
        let span = tracing::info_span!("renewal", session = %session.id(), site = %site.common_name());
        let result = session.run(self.issuer.as_ref()).instrument(span).await;

        match &result {
            Ok(()) => metrics::record_renewal("success"),
            Err(e) => metrics::record_renewal(e.stage()),
        }
        result
    }
}

/// One issuance attempt. Lives for a single `renew` call.
pub(crate) struct RenewalSession<'a> {
    id: Uuid,
    site: &'a Site,
    email: &'a str,
    settings: &'a RenewalSettings,
    state: RenewalState,
}

impl<'a> RenewalSession<'a> {
    pub(crate) fn new(site: &'a Site, email: &'a str, settings: &'a RenewalSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            site,
            email,
            settings,
            state: RenewalState::Start,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn enter(&mut self, state: RenewalState) {
        tracing::debug!(from = ?self.state, to = ?state, "Renewal state transition");
        self.state = state;
    }

    pub(crate) async fn run(mut self, issuer: &dyn AcmeIssuer) -> Result<(), RenewalError> {
        let result = self.drive(issuer).await;
        match &result {
            Ok(()) => tracing::info!("Certificate renewed"),
            Err(e) => tracing::warn!(state = ?self.state, error = %e, "Renewal failed"),
        }
        result
    }

    async fn drive(&mut self, issuer: &dyn AcmeIssuer) -> Result<(), RenewalError> {
        let hostnames = self.site.hostnames().to_vec();
        tracing::info!(hostnames = ?hostnames, "Starting certificate renewal");

        let request = csr::generate(&hostnames).map_err(RenewalError::KeyGeneration)?;

        let account = issuer
            .create_account(self.email)
            .await
            .map_err(RenewalError::Account)?;
        self.enter(RenewalState::AccountCreated);

        let mut order = account
            .new_order(&hostnames)
            .await
            .map_err(RenewalError::Order)?;
        self.enter(RenewalState::OrderCreated);

        let mut authorizations = order
            .authorizations()
            .await
            .map_err(RenewalError::Authorizations)?;
        authorizations.sort_by_key(|authz| {
            hostnames
                .iter()
                .position(|h| h.eq_ignore_ascii_case(&authz.hostname))
                .unwrap_or(usize::MAX)
        });
        self.enter(RenewalState::AuthorizationsFetched);

        self.enter(RenewalState::ChallengeLoop);
        for authorization in &authorizations {
            self.authorize(order.as_mut(), authorization).await?;
        }

        self.enter(RenewalState::Finalize);
        order
            .finalize(&request.csr_der)
            .await
            .map_err(RenewalError::Finalize)?;

        let chain = self.download(order.as_mut()).await?;
        self.enter(RenewalState::CertificateReady);

        self.enter(RenewalState::Publish);
        self.publish(&request, &chain).await?;

        self.enter(RenewalState::Idle);
        Ok(())
    }

    async fn authorize(
        &self,
        order: &mut dyn AcmeOrder,
        authorization: &Authorization,
    ) -> Result<(), RenewalError> {
        let hostname = authorization.hostname.clone();
        let challenge_error = |source: IssuerError| RenewalError::Challenge {
            hostname: hostname.clone(),
            source,
        };

        match authorization.state {
            AuthorizationState::Valid => {
                tracing::debug!(hostname = %hostname, "Authorization already valid");
                return Ok(());
            }
            AuthorizationState::Pending => {}
            state => {
                return Err(challenge_error(IssuerError::Rejected(format!(
                    "authorization is {:?}",
                    state
                ))));
            }
        }

        let challenge = authorization
            .http01
            .as_ref()
            .ok_or_else(|| RenewalError::MissingHttp01Challenge {
                hostname: hostname.clone(),
            })?;
        let key_authorization = order.key_authorization(challenge).map_err(challenge_error)?;

        let _published = self.site.publish_challenge(PendingChallenge {
            hostname: hostname.clone(),
            token: challenge.token.clone(),
            key_authorization,
        });

        order
            .set_challenge_ready(challenge)
            .await
            .map_err(challenge_error)?;

        let mut backoff = Backoff::new(
            self.settings.poll_base_ms,
            self.settings.poll_max_ms,
            self.settings.challenge_timeout,
        );
        loop {
            match order
                .authorization_status(&hostname)
                .await
                .map_err(challenge_error)?
            {
                AuthorizationState::Valid => break,
                AuthorizationState::Pending => {
                    if !backoff.wait().await {
                        return Err(RenewalError::ChallengeTimeout {
                            hostname: hostname.clone(),
                        });
                    }
                }
                state => {
                    return Err(challenge_error(IssuerError::Rejected(format!(
                        "authorization is {:?}",
                        state
                    ))));
                }
            }
        }

        tracing::info!(hostname = %hostname, polls = backoff.attempts(), "Authorization validated");
        Ok(())
    }

    async fn download(&self, order: &mut dyn AcmeOrder) -> Result<String, RenewalError> {
        let mut backoff = Backoff::new(
            self.settings.poll_base_ms,
            self.settings.poll_max_ms,
            self.settings.order_timeout,
        );
        loop {
            if let Some(chain) = order.certificate().await.map_err(RenewalError::Certificate)? {
                return Ok(chain);
            }
            if !backoff.wait().await {
                return Err(RenewalError::CertificateTimeout);
            }
        }
    }

    async fn publish(&self, request: &CertificateRequest, chain: &str) -> Result<(), RenewalError> {
        let certified = certified_key_from_pem(
            chain.as_bytes(),
            request.key_pem.as_bytes(),
            self.site.cert_path(),
        )
        .map_err(RenewalError::Publish)?;

        persist_pair(
            self.site.key_path(),
            request.key_pem.as_bytes(),
            self.site.cert_path(),
            chain.as_bytes(),
            self.id,
        )
        .await?;

        self.site.replace_certified_key(Arc::new(certified));
        Ok(())
    }
}

fn temp_path(path: &Path, session: Uuid) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.tmp", session.simple()));
    path.with_file_name(name)
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), RenewalError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| RenewalError::Persist {
            path: path.to_path_buf(),
            source,
        })
}

async fn rename_file(from: &Path, to: &Path) -> Result<(), RenewalError> {
    tokio::fs::rename(from, to)
        .await
        .map_err(|source| RenewalError::Persist {
            path: to.to_path_buf(),
            source,
        })
}

/// Write key then certificate. Both temp files exist before either rename,
/// so a failed write leaves the old pair untouched.
async fn persist_pair(
    key_path: &Path,
    key_pem: &[u8],
    cert_path: &Path,
    cert_pem: &[u8],
    session: Uuid,
) -> Result<(), RenewalError> {
    let key_tmp = temp_path(key_path, session);
    let cert_tmp = temp_path(cert_path, session);

    let result = async {
        write_file(&key_tmp, key_pem).await?;
        write_file(&cert_tmp, cert_pem).await?;
        rename_file(&key_tmp, key_path).await?;
        rename_file(&cert_tmp, cert_path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&key_tmp).await;
        let _ = tokio::fs::remove_file(&cert_tmp).await;
    }
    result
}
