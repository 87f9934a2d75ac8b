//! Plaintext companion listener.
//!
//! # Responsibilities
//! - Serve pending HTTP-01 key authorizations
//! - Run a renewal when the trusted peer asks for `/update_certificate`
//! - Redirect everything else to HTTPS
//!
//! # Design Decisions
//! - A Host no site owns gets no response at all: the service fails and
//!   hyper closes the connection
//! - HTTP/1.1 only; ACME validators and browsers following redirects need
//!   nothing more

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderValue, Method, Request, Response, StatusCode};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::http::server::Server;
use crate::lifecycle::Shutdown;
use crate::net::{ConnectionTracker, Listener, ListenerError};
use crate::observability::metrics;
use crate::security::peer_address;
use crate::site::registry::normalize_hostname;

/// Path prefix ACME validators fetch key authorizations from.
pub const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Path of the trust-gated renewal trigger.
pub const UPDATE_CERTIFICATE_PATH: &str = "/update_certificate";

const HSTS: &str = "max-age=86400";

/// How long stop() waits for open connections.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The request named a Host no site owns; the connection is dropped.
#[derive(Debug, thiserror::Error)]
#[error("unknown host {0:?}")]
pub struct Rejected(pub String);

/// Accept loop of the plaintext listener.
pub struct PlaintextListener {
    server: Server,
    listener: Listener,
    tracker: ConnectionTracker,
}

impl PlaintextListener {
    pub fn new(server: Server, listener: Listener) -> Self {
        Self {
            server,
            listener,
            tracker: ConnectionTracker::new(),
        }
    }

    /// Accept until shutdown, then wait for open connections to finish.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), ListenerError> {
        tracing::info!(
            address = ?self.listener.local_addr().ok(),
            max_connections = self.listener.max_connections(),
            "Plaintext listener starting"
        );

        let stopped = shutdown.wait();
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(ListenerError::Closed) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "Plaintext accept failed");
                            continue;
                        }
                    };
                    let guard = self.tracker.track();
                    tracing::trace!(connection_id = %guard.id(), peer_addr = %peer, "Plaintext connection accepted");
                    let server = self.server.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        serve_connection(stream, peer, server, shutdown).await;
                        drop(permit);
                        drop(guard);
                    });
                }
                _ = &mut stopped => break,
            }
        }

        tracing::info!(open_connections = self.tracker.active_count(), "Plaintext listener draining");
        if !self.tracker.wait_for_drain(DRAIN_TIMEOUT).await {
            tracing::warn!(
                open_connections = self.tracker.active_count(),
                "Plaintext connections still open after drain timeout"
            );
        }
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, server: Server, shutdown: Shutdown) {
    let service = service_fn(move |request: Request<hyper::body::Incoming>| {
        let server = server.clone();
        let (parts, _body) = request.into_parts();
        let head = Request::from_parts(parts, ());
        async move { respond(&server, &head, peer).await }
    });

    let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.wait() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        tracing::debug!(peer_addr = %peer, error = %e, "Plaintext connection closed");
    }
}

/// Classify one plaintext request and build its response.
///
/// Only the request head is consulted, so the body type is irrelevant.
pub async fn respond<B>(
    server: &Server,
    request: &Request<B>,
    peer: SocketAddr,
) -> Result<Response<Body>, Rejected> {
    let start = Instant::now();
    let host = request_host(request);

    if !server.registry().contains(&host) {
        tracing::debug!(host = %host, peer_addr = %peer, "Plaintext request for unknown host dropped");
        return Err(Rejected(host));
    }

    let path = request.uri().path();
    let response = if let Some(token) = path.strip_prefix(CHALLENGE_PREFIX) {
        challenge_response(server, request.method(), &host, token)
    } else if path == UPDATE_CERTIFICATE_PATH && server.trust().is_trusted(&peer_address(&peer)) {
        update_certificate(server, &host).await
    } else {
        redirect(request, &host, server.https_port())
    };

    metrics::record_request("plaintext", response.status().as_u16(), start);
    Ok(response)
}

fn challenge_response(server: &Server, method: &Method, host: &str, token: &str) -> Response<Body> {
    if method != Method::GET && method != Method::HEAD {
        return empty(StatusCode::METHOD_NOT_ALLOWED);
    }

    match server
        .registry()
        .get(host)
        .and_then(|site| site.challenge_response(host, token))
    {
        Some(key_authorization) => {
            tracing::info!(hostname = %host, token = %token, "Serving HTTP-01 key authorization");
            metrics::record_challenge_served(host);
            text(StatusCode::OK, key_authorization)
        }
        None => empty(StatusCode::NOT_FOUND),
    }
}

/// Runs the renewal on its own task; it completes even if the peer hangs up.
async fn update_certificate(server: &Server, host: &str) -> Response<Body> {
    tracing::info!(hostname = %host, "Renewal requested by trusted peer");
    let renewal = {
        let server = server.clone();
        let host = host.to_string();
        tokio::spawn(async move { server.renew(&host).await })
    };
    match renewal.await {
        Ok(Ok(())) => empty(StatusCode::OK),
        Ok(Err(e)) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => {
            tracing::error!(hostname = %host, error = %e, "Renewal task failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "renewal task failed".to_string())
        }
    }
}

fn redirect<B>(request: &Request<B>, host: &str, https_port: u16) -> Response<Body> {
    let location = https_location(host, https_port, request.uri().path(), request.uri().query());
    match HeaderValue::try_from(location) {
        Ok(location) => {
            let mut response = empty(StatusCode::MOVED_PERMANENTLY);
            let headers = response.headers_mut();
            headers.insert(header::LOCATION, location);
            headers.insert(header::STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(HSTS));
            response
        }
        Err(_) => empty(StatusCode::BAD_REQUEST),
    }
}

/// `https://host[:port]path[?query]`, without the port when it is 443 and
/// without a trailing slash on non-root paths.
pub fn https_location(host: &str, https_port: u16, path: &str, query: Option<&str>) -> String {
    let mut location = String::from("https://");
    location.push_str(host);
    if https_port != 443 {
        location.push(':');
        location.push_str(&https_port.to_string());
    }

    let trimmed = path.trim_end_matches('/');
    location.push_str(if trimmed.is_empty() { "/" } else { trimmed });

    if let Some(query) = query {
        location.push('?');
        location.push_str(query);
    }
    location
}

/// Host the request names, lowercased and without a port.
fn request_host<B>(request: &Request<B>) -> String {
    let raw = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default();
    normalize_hostname(strip_port(raw))
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn text(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
