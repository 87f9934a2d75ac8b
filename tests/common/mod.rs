//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, IsCa, KeyPair,
};
use rustls::pki_types::CertificateSigningRequestDer;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use hostgate::acme::{
    AcmeAccount, AcmeIssuer, AcmeOrder, Authorization, AuthorizationState, Http01Challenge,
    IssuerError,
};
use hostgate::config::{ListenerConfig, ServerConfig, SiteConfig};
use hostgate::http::ServeError;
use hostgate::net::tls::install_crypto_provider;
use hostgate::net::BoundSockets;
use hostgate::security::TrustOracle;
use hostgate::site::HandlerChain;
use hostgate::Server;

/// Write a self-signed pair for `hostnames` into `dir`.
pub fn write_site(dir: &TempDir, hostnames: &[&str], email: Option<&str>) -> SiteConfig {
    let key = KeyPair::generate().unwrap();
    let names: Vec<String> = hostnames.iter().map(|h| h.to_string()).collect();
    let cert = CertificateParams::new(names.clone())
        .unwrap()
        .self_signed(&key)
        .unwrap();

    let config = SiteConfig {
        hostnames: names,
        key_path: dir.path().join(format!("{}.key", hostnames[0])),
        cert_path: dir.path().join(format!("{}.crt", hostnames[0])),
        acme_email: email.map(str::to_string),
        body: None,
    };
    std::fs::write(&config.key_path, key.serialize_pem()).unwrap();
    std::fs::write(&config.cert_path, cert.pem()).unwrap();
    config
}

pub fn read_pair(config: &SiteConfig) -> (String, String) {
    (
        std::fs::read_to_string(&config.key_path).unwrap(),
        std::fs::read_to_string(&config.cert_path).unwrap(),
    )
}

/// Loopback listeners on ephemeral ports, fast ACME polling.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.http = ListenerConfig::with_address("127.0.0.1:0");
    config.listener.https = ListenerConfig::with_address("127.0.0.1:0");
    config.listener.inherit_systemd_sockets = false;
    config.acme.poll_interval_ms = 10;
    config.acme.max_poll_interval_ms = 50;
    config.acme.challenge_timeout_secs = 5;
    config.acme.order_timeout_secs = 5;
    config.trust.enabled = false;
    config
}

/// A site to register at startup.
pub struct SiteSpec {
    pub hostnames: &'static [&'static str],
    pub email: Option<&'static str>,
    pub handlers: HandlerChain,
}

impl SiteSpec {
    pub fn new(hostnames: &'static [&'static str], handlers: HandlerChain) -> Self {
        Self {
            hostnames,
            email: None,
            handlers,
        }
    }

    pub fn with_email(mut self, email: &'static str) -> Self {
        self.email = Some(email);
        self
    }
}

pub struct TestServer {
    pub server: Server,
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub sites: Vec<SiteConfig>,
    pub journal: Arc<Journal>,
    pub dir: TempDir,
    task: JoinHandle<Result<(), ServeError>>,
}

impl TestServer {
    pub async fn start(sites: Vec<SiteSpec>, trust: TrustOracle, script: Script) -> Self {
        install_crypto_provider();

        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let sockets = BoundSockets::acquire(&config.listener).unwrap();
        let http_addr = sockets.http.local_addr().unwrap();
        let https_addr = sockets.https.local_addr().unwrap();

        let journal = Arc::new(Journal::default());
        let issuer = ScriptedIssuer {
            ca: Arc::new(Ca::new()),
            script,
            journal: journal.clone(),
            http_port: http_addr.port(),
        };
        let server = Server::new(&config, &sockets, Arc::new(issuer), trust);

        let mut configs = Vec::new();
        for spec in sites {
            let site = write_site(&dir, spec.hostnames, spec.email);
            server.register(&site, spec.handlers).await.unwrap();
            configs.push(site);
        }

        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.run(sockets).await })
        };

        Self {
            server,
            http_addr,
            https_addr,
            sites: configs,
            journal,
            dir,
            task,
        }
    }

    /// Plaintext URL for `path` on `host`.
    pub fn http_url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", host, self.http_addr.port(), path)
    }

    pub fn https_url(&self, host: &str, path: &str) -> String {
        format!("https://{}:{}{}", host, self.https_addr.port(), path)
    }

    pub async fn stop(self) {
        self.server.stop();
        let result = tokio::time::timeout(Duration::from_secs(15), self.task)
            .await
            .expect("server did not stop")
            .unwrap();
        result.unwrap();
    }
}

/// Client resolving every `hostnames` entry to loopback, trusting any
/// certificate and never following redirects.
pub fn client(hostnames: &[&str]) -> reqwest::Client {
    install_crypto_provider();
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .danger_accept_invalid_certs(true)
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(10));
    for hostname in hostnames {
        builder = builder.resolve(hostname, SocketAddr::from(([127, 0, 0, 1], 0)));
    }
    builder.build().unwrap()
}

/// What the scripted authority does differently from a healthy one.
#[derive(Clone, Default)]
pub struct Script {
    pub fail_finalize: bool,
    /// Delay before the authority fetches a challenge.
    pub validation_delay: Duration,
}

/// One challenge fetch performed by the scripted authority.
#[derive(Debug, Clone)]
pub struct Validation {
    pub hostname: String,
    pub token: String,
    pub expected: String,
    pub status: u16,
    pub body: String,
}

impl Validation {
    pub fn passed(&self) -> bool {
        self.status == 200 && self.body == self.expected
    }
}

#[derive(Default)]
pub struct Journal {
    pub accounts: AtomicUsize,
    pub active_orders: AtomicUsize,
    pub max_active_orders: AtomicUsize,
    pub validations: Mutex<Vec<Validation>>,
}

impl Journal {
    pub fn accounts(&self) -> usize {
        self.accounts.load(Ordering::SeqCst)
    }

    pub fn validations(&self) -> Vec<Validation> {
        self.validations.lock().unwrap().clone()
    }
}

struct Ca {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl Ca {
    fn new() -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    fn sign(&self, csr_der: &[u8]) -> Result<String, IssuerError> {
        let der = CertificateSigningRequestDer::from(csr_der.to_vec());
        let leaf = CertificateSigningRequestParams::from_der(&der)
            .and_then(|csr| csr.signed_by(&self.cert, &self.key))
            .map_err(|e| IssuerError::Other(e.to_string()))?;
        Ok(format!("{}{}", leaf.pem(), self.cert.pem()))
    }
}

/// In-memory authority that validates HTTP-01 challenges by fetching them
/// from the server's plaintext listener, like a real validator would.
struct ScriptedIssuer {
    ca: Arc<Ca>,
    script: Script,
    journal: Arc<Journal>,
    http_port: u16,
}

struct ScriptedAccount {
    ca: Arc<Ca>,
    script: Script,
    journal: Arc<Journal>,
    http_port: u16,
}

struct ScriptedOrder {
    ca: Arc<Ca>,
    script: Script,
    journal: Arc<Journal>,
    http_port: u16,
    challenges: Vec<(String, Http01Challenge, AuthorizationState)>,
    csr: Option<Vec<u8>>,
}

impl Drop for ScriptedOrder {
    fn drop(&mut self) {
        self.journal.active_orders.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AcmeIssuer for ScriptedIssuer {
    async fn create_account(&self, _email: &str) -> Result<Box<dyn AcmeAccount>, IssuerError> {
        self.journal.accounts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedAccount {
            ca: self.ca.clone(),
            script: self.script.clone(),
            journal: self.journal.clone(),
            http_port: self.http_port,
        }))
    }
}

#[async_trait]
impl AcmeAccount for ScriptedAccount {
    async fn new_order(&self, hostnames: &[String]) -> Result<Box<dyn AcmeOrder>, IssuerError> {
        let active = self.journal.active_orders.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.max_active_orders.fetch_max(active, Ordering::SeqCst);

        let order_id = self.journal.accounts.load(Ordering::SeqCst);
        let challenges = hostnames
            .iter()
            .enumerate()
            .map(|(i, hostname)| {
                let challenge = Http01Challenge {
                    token: format!("tok{}x{}", order_id, i),
                    url: format!("https://acme.test/chall/{}/{}", order_id, i),
                };
                (hostname.clone(), challenge, AuthorizationState::Pending)
            })
            .collect();

        Ok(Box::new(ScriptedOrder {
            ca: self.ca.clone(),
            script: self.script.clone(),
            journal: self.journal.clone(),
            http_port: self.http_port,
            challenges,
            csr: None,
        }))
    }
}

#[async_trait]
impl AcmeOrder for ScriptedOrder {
    async fn authorizations(&mut self) -> Result<Vec<Authorization>, IssuerError> {
        Ok(self
            .challenges
            .iter()
            .map(|(hostname, challenge, state)| Authorization {
                hostname: hostname.clone(),
                state: *state,
                http01: Some(challenge.clone()),
            })
            .collect())
    }

    fn key_authorization(&self, challenge: &Http01Challenge) -> Result<String, IssuerError> {
        Ok(format!("{}.account-thumbprint", challenge.token))
    }

    async fn set_challenge_ready(&mut self, challenge: &Http01Challenge) -> Result<(), IssuerError> {
        let index = self
            .challenges
            .iter()
            .position(|(_, c, _)| c == challenge)
            .ok_or_else(|| IssuerError::Other("unknown challenge".into()))?;
        let hostname = self.challenges[index].0.clone();
        let expected = self.key_authorization(challenge)?;
        tokio::time::sleep(self.script.validation_delay).await;

        let url = format!(
            "http://{}:{}/.well-known/acme-challenge/{}",
            hostname, self.http_port, challenge.token
        );
        let response = client(&[hostname.as_str()])
            .get(url)
            .send()
            .await
            .map_err(|e| IssuerError::Other(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        let validation = Validation {
            hostname,
            token: challenge.token.clone(),
            expected,
            status,
            body,
        };
        self.challenges[index].2 = if validation.passed() {
            AuthorizationState::Valid
        } else {
            AuthorizationState::Invalid
        };
        self.journal.validations.lock().unwrap().push(validation);
        Ok(())
    }

    async fn authorization_status(&mut self, hostname: &str) -> Result<AuthorizationState, IssuerError> {
        self.challenges
            .iter()
            .find(|(h, _, _)| h == hostname)
            .map(|(_, _, state)| *state)
            .ok_or_else(|| IssuerError::Other(format!("no authorization for {}", hostname)))
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), IssuerError> {
        if self.script.fail_finalize {
            return Err(IssuerError::Rejected("badCSR".into()));
        }
        self.csr = Some(csr_der.to_vec());
        Ok(())
    }

    async fn certificate(&mut self) -> Result<Option<String>, IssuerError> {
        match &self.csr {
            Some(csr) => self.ca.sign(csr).map(Some),
            None => Ok(None),
        }
    }
}
