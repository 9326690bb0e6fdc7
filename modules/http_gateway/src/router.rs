use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::Method;
use axum::middleware::Next;
use axum::routing::MethodFilter;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use flowkit::{Module, ModuleCtx};

use crate::capabilities::{RouteSpec, RouterService};

/// Shared route collection behind the `RouterService` capability.
#[derive(Default)]
pub struct SharedRouter {
    name: String,
    routes: Mutex<Vec<RouteSpec>>,
    registered: DashMap<(Method, String), ()>,
}

impl SharedRouter {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ..Default::default()
        })
    }

    pub fn route_count(&self) -> usize {
        self.routes.lock().len()
    }
}

impl RouterService for SharedRouter {
    fn add_route(&self, spec: RouteSpec) -> anyhow::Result<()> {
        let key = (spec.method.clone(), spec.path.clone());
        if self.registered.insert(key, ()).is_some() {
            anyhow::bail!(
                "route {} {} is already registered on router '{}'",
                spec.method,
                spec.path,
                self.name
            );
        }
        debug!(router = %self.name, method = %spec.method, path = %spec.path, "Route registered");
        self.routes.lock().push(spec);
        Ok(())
    }

    fn has_route(&self, method: &Method, path: &str) -> bool {
        self.registered
            .contains_key(&(method.clone(), path.to_string()))
    }

    fn build(&self) -> axum::Router {
        let routes = self.routes.lock();

        // Specs for the same path fold into one MethodRouter; each spec's
        // middleware chain wraps only its own method.
        let mut by_path: BTreeMap<String, axum::routing::MethodRouter> = BTreeMap::new();
        for spec in routes.iter() {
            let handler = spec.handler.clone();
            let endpoint = move |req: Request| {
                let handler = handler.clone();
                async move { handler.handle(req).await }
            };

            let filter = match MethodFilter::try_from(spec.method.clone()) {
                Ok(f) => f,
                Err(e) => {
                    error!(method = %spec.method, error = %e, "Unsupported route method; skipping");
                    continue;
                }
            };
            let mut method_router = axum::routing::on(filter, endpoint);

            // First declared middleware ends up outermost: apply layers in
            // reverse, since the last layer added wraps the rest.
            for mw in spec.middlewares.iter().rev() {
                let mw = mw.clone();
                method_router = method_router.layer(axum::middleware::from_fn(
                    move |req: Request, next: Next| {
                        let mw = mw.clone();
                        async move { mw.handle(req, next).await }
                    },
                ));
            }

            let combined = match by_path.remove(&spec.path) {
                Some(existing) => existing.merge(method_router),
                None => method_router,
            };
            by_path.insert(spec.path.clone(), combined);
        }

        let mut router = axum::Router::new();
        for (path, method_router) in by_path {
            router = router.route(&path, method_router);
        }
        router
    }
}

/// The `http.router` module: publishes a [`SharedRouter`] under the module
/// name. Routes accumulate during configure/wiring; the owning server
/// calls `build` at start.
pub struct HttpRouterModule {
    name: String,
    inner: Arc<SharedRouter>,
}

impl HttpRouterModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: SharedRouter::new(name),
        }
    }

    pub fn inner(&self) -> Arc<SharedRouter> {
        self.inner.clone()
    }
}

#[async_trait]
impl Module for HttpRouterModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        ctx.registry()
            .register(self.name.clone(), self.inner.clone() as Arc<dyn RouterService>)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::HttpHandler;
    use axum::response::{IntoResponse, Response};
    use tower::ServiceExt;

    struct TagHandler(&'static str);

    #[async_trait]
    impl HttpHandler for TagHandler {
        async fn handle(&self, _req: Request) -> Response {
            self.0.into_response()
        }
    }

    /// Appends its tag to a response header, proving invocation order.
    struct TagMiddleware(&'static str);

    #[async_trait]
    impl crate::capabilities::HttpMiddleware for TagMiddleware {
        async fn handle(&self, req: Request, next: Next) -> Response {
            let mut resp = next.run(req).await;
            resp.headers_mut().append(
                "x-chain",
                axum::http::HeaderValue::from_static(self.0),
            );
            resp
        }
    }

    #[tokio::test]
    async fn duplicate_route_is_rejected() {
        let router = SharedRouter::new("api");
        router
            .add_route(RouteSpec::new(Method::GET, "/a", Arc::new(TagHandler("1"))))
            .unwrap();
        assert!(router.has_route(&Method::GET, "/a"));
        assert!(!router.has_route(&Method::POST, "/a"));

        let err = router
            .add_route(RouteSpec::new(Method::GET, "/a", Arc::new(TagHandler("2"))))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn built_router_serves_routes() {
        let router = SharedRouter::new("api");
        router
            .add_route(RouteSpec::new(Method::GET, "/ping", Arc::new(TagHandler("pong"))))
            .unwrap();
        router
            .add_route(RouteSpec::new(Method::POST, "/ping", Arc::new(TagHandler("posted"))))
            .unwrap();

        let app = router.build();

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::get("/ping")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"pong");

        let resp = app
            .oneshot(
                axum::http::Request::post("/ping")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"posted");
    }

    #[tokio::test]
    async fn middleware_chain_applies_outer_to_inner_in_declaration_order() {
        let router = SharedRouter::new("api");
        router
            .add_route(
                RouteSpec::new(Method::GET, "/x", Arc::new(TagHandler("ok"))).with_middlewares(
                    vec![Arc::new(TagMiddleware("outer")), Arc::new(TagMiddleware("inner"))],
                ),
            )
            .unwrap();

        let resp = router
            .build()
            .oneshot(
                axum::http::Request::get("/x")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        // Response headers append on the way out: inner first, outer last.
        let chain: Vec<_> = resp
            .headers()
            .get_all("x-chain")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(chain, vec!["inner", "outer"]);
    }
}
