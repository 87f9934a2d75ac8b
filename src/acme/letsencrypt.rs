//! `instant-acme` backed issuer.
//!
//! Each `create_account` registers a fresh account key, as the renewal flow
//! does not keep ACME credentials between runs.

use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};

use super::error::IssuerError;
use super::issuer::{
    AcmeAccount, AcmeIssuer, AcmeOrder, Authorization, AuthorizationState, Http01Challenge,
};
use crate::config::AcmeConfig;
use crate::resilience::Backoff;

/// Polling behaviour shared by the issuer's orders.
#[derive(Debug, Clone)]
struct Polling {
    base_ms: u64,
    max_ms: u64,
    order_timeout: Duration,
}

/// Issuer talking to an ACME directory such as Let's Encrypt.
#[derive(Debug, Clone)]
pub struct LetsEncryptIssuer {
    directory_url: String,
    polling: Polling,
}

impl LetsEncryptIssuer {
    pub fn new(config: &AcmeConfig) -> Self {
        Self {
            directory_url: config.directory_url.clone(),
            polling: Polling {
                base_ms: config.poll_interval_ms,
                max_ms: config.max_poll_interval_ms,
                order_timeout: Duration::from_secs(config.order_timeout_secs),
            },
        }
    }
}

#[async_trait]
impl AcmeIssuer for LetsEncryptIssuer {
    async fn create_account(&self, email: &str) -> Result<Box<dyn AcmeAccount>, IssuerError> {
        let contact = format!("mailto:{}", email);
        let (account, _credentials) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        tracing::debug!(directory = %self.directory_url, "ACME account created");
        Ok(Box::new(LetsEncryptAccount {
            account,
            polling: self.polling.clone(),
        }))
    }
}

struct LetsEncryptAccount {
    account: Account,
    polling: Polling,
}

#[async_trait]
impl AcmeAccount for LetsEncryptAccount {
    async fn new_order(&self, hostnames: &[String]) -> Result<Box<dyn AcmeOrder>, IssuerError> {
        let identifiers = hostnames
            .iter()
            .map(|name| Identifier::Dns(name.clone()))
            .collect::<Vec<_>>();
        let order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        Ok(Box::new(LetsEncryptOrder {
            order,
            fetched: Vec::new(),
            polling: self.polling.clone(),
        }))
    }
}

struct LetsEncryptOrder {
    order: Order,
    /// Last fetched authorizations; key authorizations are computed from them.
    fetched: Vec<instant_acme::Authorization>,
    polling: Polling,
}

impl LetsEncryptOrder {
    async fn refresh_authorizations(&mut self) -> Result<(), IssuerError> {
        self.fetched = self.order.authorizations().await?;
        Ok(())
    }
}

fn hostname_of(authz: &instant_acme::Authorization) -> &str {
    let Identifier::Dns(name) = &authz.identifier;
    name
}

fn state_of(status: &AuthorizationStatus) -> AuthorizationState {
    match status {
        AuthorizationStatus::Pending => AuthorizationState::Pending,
        AuthorizationStatus::Valid => AuthorizationState::Valid,
        AuthorizationStatus::Invalid => AuthorizationState::Invalid,
        _ => AuthorizationState::Unusable,
    }
}

#[async_trait]
impl AcmeOrder for LetsEncryptOrder {
    async fn authorizations(&mut self) -> Result<Vec<Authorization>, IssuerError> {
        self.refresh_authorizations().await?;
        Ok(self
            .fetched
            .iter()
            .map(|authz| Authorization {
                hostname: hostname_of(authz).to_string(),
                state: state_of(&authz.status),
                http01: authz
                    .challenges
                    .iter()
                    .find(|c| c.r#type == ChallengeType::Http01)
                    .map(|c| Http01Challenge {
                        token: c.token.clone(),
                        url: c.url.clone(),
                    }),
            })
            .collect())
    }

    fn key_authorization(&self, challenge: &Http01Challenge) -> Result<String, IssuerError> {
        self.fetched
            .iter()
            .flat_map(|authz| authz.challenges.iter())
            .find(|c| c.url == challenge.url)
            .map(|c| self.order.key_authorization(c).as_str().to_string())
            .ok_or_else(|| IssuerError::Other(format!("unknown challenge {}", challenge.url)))
    }

    async fn set_challenge_ready(&mut self, challenge: &Http01Challenge) -> Result<(), IssuerError> {
        self.order.set_challenge_ready(&challenge.url).await?;
        Ok(())
    }

    async fn authorization_status(&mut self, hostname: &str) -> Result<AuthorizationState, IssuerError> {
        self.refresh_authorizations().await?;
        self.fetched
            .iter()
            .find(|authz| hostname_of(authz).eq_ignore_ascii_case(hostname))
            .map(|authz| state_of(&authz.status))
            .ok_or_else(|| IssuerError::Other(format!("no authorization for {}", hostname)))
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), IssuerError> {
        let mut backoff = Backoff::new(
            self.polling.base_ms,
            self.polling.max_ms,
            self.polling.order_timeout,
        );
        loop {
            let state = self.order.refresh().await?;
            match state.status {
                OrderStatus::Ready => break,
                OrderStatus::Invalid => {
                    let detail = state
                        .error
                        .as_ref()
                        .and_then(|problem| problem.detail.clone())
                        .unwrap_or_else(|| "order is invalid".to_string());
                    return Err(IssuerError::Rejected(detail));
                }
                OrderStatus::Valid | OrderStatus::Processing => {
                    return Err(IssuerError::Other(format!(
                        "order already finalized ({:?})",
                        state.status
                    )));
                }
                OrderStatus::Pending => {
                    if !backoff.wait().await {
                        return Err(IssuerError::Timeout("order to become ready"));
                    }
                }
            }
        }
        self.order.finalize(csr_der).await?;
        Ok(())
    }

    async fn certificate(&mut self) -> Result<Option<String>, IssuerError> {
        Ok(self.order.certificate().await?)
    }
}
