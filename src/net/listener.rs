//! Listening sockets and the bounded accept loop.
//!
//! # Responsibilities
//! - Acquire the plaintext and TLS sockets, either inherited from the service
//!   manager (fd 3 and fd 4) or bound from configuration
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::config::{ListenerConfig, ListenersConfig};

/// First inherited descriptor under socket activation.
#[cfg(unix)]
const SD_LISTEN_FDS_START: i32 = 3;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind(String, std::io::Error),
    /// Inherited sockets were announced but unusable.
    Inherit(String),
    /// Failed to accept connection.
    Accept(std::io::Error),
    /// The listener was closed.
    Closed,
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            ListenerError::Inherit(msg) => write!(f, "Failed to inherit sockets: {}", msg),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
            ListenerError::Closed => write!(f, "Listener closed"),
        }
    }
}

impl std::error::Error for ListenerError {}

/// The two sockets the server runs on, not yet attached to a runtime.
#[derive(Debug)]
pub struct BoundSockets {
    pub http: std::net::TcpListener,
    pub https: std::net::TcpListener,
}

impl BoundSockets {
    /// Inherit sockets when the service manager passed them, else bind.
    pub fn acquire(config: &ListenersConfig) -> Result<Self, ListenerError> {
        if config.inherit_systemd_sockets {
            if let Some(sockets) = Self::inherit()? {
                return Ok(sockets);
            }
        }
        Ok(Self {
            http: bind_std(&config.http)?,
            https: bind_std(&config.https)?,
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn https_port(&self) -> u16 {
        self.https.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    #[cfg(unix)]
    fn inherit() -> Result<Option<Self>, ListenerError> {
        use std::os::unix::io::FromRawFd;

        let count = match std::env::var("LISTEN_FDS") {
            Ok(value) => value
                .trim()
                .parse::<i32>()
                .map_err(|_| ListenerError::Inherit(format!("LISTEN_FDS={:?}", value)))?,
            Err(_) => return Ok(None),
        };
        if count < 2 {
            return Err(ListenerError::Inherit(format!(
                "expected 2 descriptors, LISTEN_FDS={}",
                count
            )));
        }

        // SAFETY: the service manager hands us ownership of fds 3 and 4 as
        // listening stream sockets; nothing else in the process opens them.
        let (http, https) = unsafe {
            (
                std::net::TcpListener::from_raw_fd(SD_LISTEN_FDS_START),
                std::net::TcpListener::from_raw_fd(SD_LISTEN_FDS_START + 1),
            )
        };
        for socket in [&http, &https] {
            socket
                .set_nonblocking(true)
                .map_err(|e| ListenerError::Inherit(e.to_string()))?;
        }

        tracing::info!(
            http = ?http.local_addr().ok(),
            https = ?https.local_addr().ok(),
            "Inherited listening sockets"
        );
        Ok(Some(Self { http, https }))
    }

    #[cfg(not(unix))]
    fn inherit() -> Result<Option<Self>, ListenerError> {
        Ok(None)
    }
}

fn bind_std(config: &ListenerConfig) -> Result<std::net::TcpListener, ListenerError> {
    let addr = &config.bind_address;
    let listener =
        std::net::TcpListener::bind(addr).map_err(|e| ListenerError::Bind(addr.clone(), e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| ListenerError::Bind(addr.clone(), e))?;

    tracing::info!(
        address = %listener.local_addr().map_err(|e| ListenerError::Bind(addr.clone(), e))?,
        max_connections = config.max_connections,
        "Listener bound"
    );
    Ok(listener)
}

/// A bounded TCP listener that limits concurrent connections.
///
/// When the limit is reached, `accept` waits until a slot frees up.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Attach an already-bound socket to the current runtime.
    pub fn from_std(
        listener: std::net::TcpListener,
        max_connections: usize,
    ) -> Result<Self, ListenerError> {
        listener
            .set_nonblocking(true)
            .map_err(ListenerError::Accept)?;
        let inner = TcpListener::from_std(listener).map_err(ListenerError::Accept)?;
        Ok(Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// The returned permit must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A connection slot, released when dropped.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
