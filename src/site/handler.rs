//! Application handler contract.
//!
//! A site owns an ordered chain of handlers. Each handler first decides
//! whether it accepts a request (`accept`, side-effect free) and, if so,
//! produces the response (`handle`). The first handler to accept wins.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::http::server::Server;

/// What a handler knows about the request beyond the request itself.
#[derive(Clone, Debug)]
pub struct Exchange {
    /// Server name negotiated during the TLS handshake.
    pub hostname: String,
    /// Peer IP, without the IPv4-mapped IPv6 prefix.
    pub remote_address: String,
    /// Peer address equals this process's probed public IP.
    pub local: bool,
    /// Facade of the server that accepted the connection.
    pub server: Server,
}

/// Error type for request handling.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("handler failed: {0}")]
    Handler(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("handler panicked")]
    Panicked,
}

impl DispatchError {
    pub fn handler(message: impl Into<String>) -> Self {
        DispatchError::Handler(message.into())
    }
}

/// A request handler attached to a site.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Whatever `accept` extracts for `handle`.
    type Context: Send + 'static;

    /// Decide whether this handler serves the request. Must not respond.
    fn accept(&self, request: &Request<Body>, exchange: &Exchange) -> Option<Self::Context>;

    /// Produce the response for an accepted request.
    async fn handle(
        &self,
        context: Self::Context,
        request: Request<Body>,
    ) -> Result<Response, DispatchError>;
}

enum Outcome {
    Handled(Result<Response, DispatchError>),
    Declined(Request<Body>),
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn try_handle(&self, request: Request<Body>, exchange: &Exchange) -> Outcome;
}

#[async_trait]
impl<H: Handler> ErasedHandler for H {
    async fn try_handle(&self, request: Request<Body>, exchange: &Exchange) -> Outcome {
        match self.accept(&request, exchange) {
            Some(context) => Outcome::Handled(self.handle(context, request).await),
            None => Outcome::Declined(request),
        }
    }
}

/// Ordered handlers of one site.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn ErasedHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; earlier handlers get the first chance to accept.
    pub fn with<H: Handler>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the first accepting handler, or answer 404 when none accepts.
    pub async fn dispatch(
        &self,
        mut request: Request<Body>,
        exchange: &Exchange,
    ) -> Result<Response, DispatchError> {
        for handler in &self.handlers {
            match handler.try_handle(request, exchange).await {
                Outcome::Handled(result) => return Ok(result?),
                Outcome::Declined(returned) => request = returned,
            }
        }
        Ok(StatusCode::NOT_FOUND.into_response())
    }
}

/// Serves a fixed text body for GET and HEAD.
#[derive(Debug, Clone)]
pub struct TextHandler {
    body: String,
}

impl TextHandler {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

#[async_trait]
impl Handler for TextHandler {
    type Context = ();

    fn accept(&self, request: &Request<Body>, _exchange: &Exchange) -> Option<()> {
        (request.method() == Method::GET || request.method() == Method::HEAD).then_some(())
    }

    async fn handle(&self, _context: (), _request: Request<Body>) -> Result<Response, DispatchError> {
        Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.body.clone(),
        )
            .into_response())
    }
}
