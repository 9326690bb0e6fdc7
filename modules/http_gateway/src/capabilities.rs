//! HTTP capability traits shared across modules: handlers, middlewares and
//! routers rendezvous through the service registry using these types.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use flowkit::{ErrorBody, ErrorKind, WorkflowError};

/// A terminal request handler published in the registry.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle(&self, req: Request) -> Response;
}

/// One element of a route's middleware chain. Chains are applied
/// outer-to-inner in declaration order.
#[async_trait]
pub trait HttpMiddleware: Send + Sync {
    async fn handle(&self, req: Request, next: Next) -> Response;
}

/// A route to be registered on a router.
pub struct RouteSpec {
    pub method: Method,
    pub path: String,
    pub handler: Arc<dyn HttpHandler>,
    pub middlewares: Vec<Arc<dyn HttpMiddleware>>,
}

impl RouteSpec {
    pub fn new(method: Method, path: impl Into<String>, handler: Arc<dyn HttpHandler>) -> Self {
        Self {
            method,
            path: path.into(),
            handler,
            middlewares: Vec::new(),
        }
    }

    pub fn with_middlewares(mut self, middlewares: Vec<Arc<dyn HttpMiddleware>>) -> Self {
        self.middlewares = middlewares;
        self
    }
}

/// The router capability: collects routes during configuration; the owning
/// server builds the final axum router at start.
pub trait RouterService: Send + Sync {
    fn add_route(&self, spec: RouteSpec) -> anyhow::Result<()>;

    fn has_route(&self, method: &Method, path: &str) -> bool;

    fn build(&self) -> axum::Router;
}

/// Map a handler failure to the structured `{error, message, details}`
/// body, honoring a kinded [`WorkflowError`] anywhere in the chain.
pub fn error_response(err: &anyhow::Error) -> Response {
    let (status, body) = match err.downcast_ref::<WorkflowError>() {
        Some(workflow_err) => (workflow_err.http_status(), workflow_err.body()),
        None => (
            500,
            ErrorBody::new(ErrorKind::Permanent, err.to_string()),
        ),
    };
    let status =
        axum::http::StatusCode::from_u16(status).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(body)).into_response()
}
