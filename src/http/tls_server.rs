//! TLS listener and per-site dispatch.
//!
//! # Responsibilities
//! - Terminate TLS with the SNI resolver over the site registry
//! - Record the negotiated server name on every request of the connection
//! - Dispatch to the owning site's handler chain
//! - Turn handler errors and panics into a bare 500
//!
//! # Data Flow
//! ```text
//! TcpStream
//!     → SniAcceptor (rustls handshake, server name → TlsSession extension)
//!     → Router fallback: dispatch()
//!     → Site::handlers().dispatch(request, Exchange)
//! ```

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::AddExtension,
    response::{IntoResponse, Response},
    Extension, Router,
};
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use axum_server::Handle;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower::Layer;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::TlsConfig;
use crate::http::server::{ServeError, Server};
use crate::lifecycle::Shutdown;
use crate::net::tls;
use crate::observability::metrics;
use crate::security::peer_address;
use crate::site::{DispatchError, Exchange};

/// How long stop() lets in-flight TLS requests finish.
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(10);

/// Facts about the TLS session a request arrived on.
#[derive(Debug, Clone)]
pub struct TlsSession {
    pub server_name: Option<String>,
}

/// Rustls acceptor that exposes the negotiated server name to handlers.
#[derive(Clone)]
pub struct SniAcceptor {
    inner: RustlsAcceptor,
}

impl SniAcceptor {
    pub fn new(config: RustlsConfig, handshake_timeout: Duration) -> Self {
        Self {
            inner: RustlsAcceptor::new(config).handshake_timeout(handshake_timeout),
        }
    }
}

impl<I, S> Accept<I, S> for SniAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, TlsSession>;
    type Future = Pin<Box<dyn Future<Output = io::Result<(Self::Stream, Self::Service)>> + Send>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let session = TlsSession {
                server_name: stream.get_ref().1.server_name().map(str::to_string),
            };
            Ok((stream, Extension(session).layer(service)))
        })
    }
}

#[allow(deprecated)]
fn build_router(server: Server, config: &TlsConfig, max_in_flight: usize) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(server)
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
        .layer(GlobalConcurrencyLimitLayer::new(max_in_flight))
        .layer(TraceLayer::new_for_http())
}

/// Serve TLS on `listener` until shutdown. At most `max_in_flight`
/// requests are handled at once; the rest queue.
pub async fn serve(
    server: Server,
    listener: std::net::TcpListener,
    config: &TlsConfig,
    max_in_flight: usize,
    shutdown: Shutdown,
) -> Result<(), ServeError> {
    let rustls_config = RustlsConfig::from_config(Arc::new(tls::server_config(server.registry().clone())?));
    let acceptor = SniAcceptor::new(rustls_config, Duration::from_secs(config.handshake_timeout_secs));
    let app = build_router(server, config, max_in_flight);

    let handle = Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            shutdown.wait().await;
            handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
        });
    }

    tracing::info!(address = ?listener.local_addr().ok(), "TLS listener starting");
    axum_server::from_tcp(listener)
        .acceptor(acceptor)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(ServeError::Io)?;

    tracing::info!("TLS listener stopped");
    Ok(())
}

/// Fallback handler: every request goes to the owning site's handlers.
async fn dispatch(
    State(server): State<Server>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Extension(session): Extension<TlsSession>,
    request: Request<Body>,
) -> Response {
    let start = Instant::now();

    let Some(hostname) = session.server_name else {
        return StatusCode::MISDIRECTED_REQUEST.into_response();
    };
    let Some(site) = server.registry().get(&hostname) else {
        tracing::warn!(hostname = %hostname, "Request on a session for an unregistered host");
        return StatusCode::MISDIRECTED_REQUEST.into_response();
    };

    let remote_address = peer_address(&peer);
    let exchange = Exchange {
        local: server.trust().is_trusted(&remote_address),
        hostname,
        remote_address,
        server: server.clone(),
    };

    let outcome = AssertUnwindSafe(site.handlers().dispatch(request, &exchange))
        .catch_unwind()
        .await
        .unwrap_or(Err(DispatchError::Panicked));

    let response = match outcome {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(
                hostname = %exchange.hostname,
                peer_addr = %exchange.remote_address,
                error = %e,
                "Handler failed"
            );
            metrics::record_dispatch_failure(match e {
                DispatchError::Panicked => "panic",
                _ => "error",
            });
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    };

    metrics::record_request("tls", response.status().as_u16(), start);
    response
}
