//! Server facade.
//!
//! # Responsibilities
//! - Own the site registry, the trust oracle and the certificate manager
//! - Expose ports, registered hostnames, registration and renewal to the
//!   binary and to handlers
//! - Run both listeners on sockets handed in by the caller
//! - Stop everything on request

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::acme::{AcmeIssuer, CertificateManager, RenewalError, RenewalSettings};
use crate::config::{ServerConfig, SiteConfig, TlsConfig};
use crate::http::plaintext::PlaintextListener;
use crate::http::tls_server;
use crate::lifecycle::Shutdown;
use crate::net::{BoundSockets, Listener, ListenerError, TlsError};
use crate::security::TrustOracle;
use crate::site::{HandlerChain, RegistrationError, SiteRegistry};

/// Error type for running the listeners.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("TLS listener failed: {0}")]
    Io(#[source] std::io::Error),
}

struct Inner {
    registry: SiteRegistry,
    trust: TrustOracle,
    manager: Arc<CertificateManager>,
    tls: TlsConfig,
    http_max_connections: usize,
    https_max_connections: usize,
    http_port: u16,
    https_port: u16,
    shutdown: Shutdown,
}

/// Handle to a running (or about to run) server. Clones share state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("http_port", &self.inner.http_port)
            .field("https_port", &self.inner.https_port)
            .field("sites", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// A server for `sockets`, with no sites registered yet.
    pub fn new(
        config: &ServerConfig,
        sockets: &BoundSockets,
        issuer: Arc<dyn AcmeIssuer>,
        trust: TrustOracle,
    ) -> Self {
        let registry = SiteRegistry::new();
        let manager = Arc::new(CertificateManager::new(
            registry.clone(),
            issuer,
            RenewalSettings::from(&config.acme),
        ));
        Self {
            inner: Arc::new(Inner {
                registry,
                trust,
                manager,
                tls: config.tls.clone(),
                http_max_connections: config.listener.http.max_connections,
                https_max_connections: config.listener.https.max_connections,
                http_port: sockets.http_port(),
                https_port: sockets.https_port(),
                shutdown: Shutdown::new(),
            }),
        }
    }

    pub fn http_port(&self) -> u16 {
        self.inner.http_port
    }

    pub fn https_port(&self) -> u16 {
        self.inner.https_port
    }

    /// Every hostname some site answers for.
    pub fn registered_hostnames(&self) -> BTreeSet<String> {
        self.inner.registry.hostnames()
    }

    /// Load a site's key and certificate and start serving its hostnames.
    pub async fn register(
        &self,
        config: &SiteConfig,
        handlers: HandlerChain,
    ) -> Result<(), RegistrationError> {
        self.inner.registry.register(config, handlers).await?;
        Ok(())
    }

    /// Renew the certificate of the site owning `hostname`.
    pub async fn renew(&self, hostname: &str) -> Result<(), RenewalError> {
        self.inner.manager.renew(hostname).await
    }

    /// Stop accepting on both listeners and let open connections drain.
    pub fn stop(&self) {
        if !self.inner.shutdown.is_triggered() {
            tracing::info!("Server stopping");
        }
        self.inner.shutdown.trigger();
    }

    pub fn registry(&self) -> &SiteRegistry {
        &self.inner.registry
    }

    pub fn trust(&self) -> &TrustOracle {
        &self.inner.trust
    }

    pub fn certificate_manager(&self) -> Arc<CertificateManager> {
        self.inner.manager.clone()
    }

    pub fn shutdown(&self) -> Shutdown {
        self.inner.shutdown.clone()
    }

    /// Serve both listeners until `stop` is called.
    pub async fn run(&self, sockets: BoundSockets) -> Result<(), ServeError> {
        let http = Listener::from_std(sockets.http, self.inner.http_max_connections)?;
        let plaintext = PlaintextListener::new(self.clone(), http).run(self.shutdown());
        let tls = async {
            let result = tls_server::serve(
                self.clone(),
                sockets.https,
                &self.inner.tls,
                self.inner.https_max_connections,
                self.shutdown(),
            )
            .await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "TLS listener exited");
                self.stop();
            }
            result
        };

        let (plaintext, tls) = tokio::join!(plaintext, tls);
        plaintext?;
        tls
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let config = ServerConfig::default();
        let registry = SiteRegistry::new();
        let issuer = Arc::new(crate::acme::LetsEncryptIssuer::new(&config.acme));
        Self {
            inner: Arc::new(Inner {
                manager: Arc::new(CertificateManager::new(
                    registry.clone(),
                    issuer,
                    RenewalSettings::from(&config.acme),
                )),
                registry,
                trust: TrustOracle::new(),
                tls: config.tls,
                http_max_connections: 16,
                https_max_connections: 16,
                http_port: 0,
                https_port: 0,
                shutdown: Shutdown::new(),
            }),
        }
    }
}
