use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer};
use tracing::{info, warn};

use flowkit::{Module, ModuleCtx, StatefulModule, WireableModule};

use crate::capabilities::RouterService;
use crate::wiring::{select_router, ServerBinding};

fn default_addr() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_body_limit() -> usize {
    2 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_request_timeout", rename = "requestTimeoutSecs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_body_limit", rename = "bodyLimitBytes")]
    pub body_limit_bytes: usize,
    /// Explicit router to serve; falls back to the wiring precedence.
    #[serde(default)]
    pub router: Option<String>,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            request_timeout_secs: default_request_timeout(),
            body_limit_bytes: default_body_limit(),
            router: None,
        }
    }
}

/// The `http.server` module: binds a socket at start and serves the routes
/// of the router it was wired to, shutting down gracefully on cancel.
pub struct HttpServerModule {
    name: String,
    config: ArcSwap<HttpServerConfig>,
    binding: ServerBinding,
    router: RwLock<Option<Arc<dyn RouterService>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HttpServerModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: ArcSwap::from_pointee(HttpServerConfig::default()),
            binding: ServerBinding::new(),
            router: RwLock::new(None),
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Module for HttpServerModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg: HttpServerConfig = ctx.config()?;
        cfg.addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid bind address '{}': {e}", cfg.addr))?;
        self.config.store(Arc::new(cfg));

        // Dependents discover this server's router through the binding.
        ctx.registry()
            .register(self.name.clone(), self.binding.clone())?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_stateful(&self) -> Option<&dyn StatefulModule> {
        Some(self)
    }

    fn as_wireable(&self) -> Option<&dyn WireableModule> {
        Some(self)
    }
}

impl WireableModule for HttpServerModule {
    fn wire(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg = self.config.load();
        let (router_name, router) = select_router(ctx, cfg.router.as_deref())?;
        info!(server = %self.name, router = %router_name, "Server wired to router");
        self.binding.set_router(router_name);
        *self.router.write() = Some(router);
        Ok(())
    }
}

#[async_trait]
impl StatefulModule for HttpServerModule {
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let cfg = self.config.load_full();
        let router = self
            .router
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("server '{}' has no router wired", self.name))?;

        let app = router
            .build()
            .layer(TimeoutLayer::new(Duration::from_secs(
                cfg.request_timeout_secs,
            )))
            .layer(RequestBodyLimitLayer::new(cfg.body_limit_bytes));

        let addr: SocketAddr = cfg.addr.parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(server = %self.name, %addr, "HTTP server bound");

        let name = self.name.clone();
        let shutdown = {
            let cancel = cancel.clone();
            async move {
                cancel.cancelled().await;
                info!("HTTP server shutting down gracefully (cancellation)");
            }
        };
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(server = %name, error = %e, "HTTP server exited with error");
            }
        });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // The engine cancels the run token before stop; give the
            // graceful shutdown a bounded window.
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!(server = %self.name, "HTTP server did not stop in time");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{HttpHandler, RouteSpec};
    use crate::router::HttpRouterModule;
    use axum::response::{IntoResponse, Response};
    use flowkit::{EngineCtx, EventBus, ServiceRegistry};
    use std::path::PathBuf;

    struct Pong;

    #[async_trait]
    impl HttpHandler for Pong {
        async fn handle(&self, _req: axum::extract::Request) -> Response {
            "pong".into_response()
        }
    }

    fn ctx(registry: Arc<ServiceRegistry>, config: serde_json::Value) -> ModuleCtx {
        ModuleCtx::new(
            "web",
            config,
            vec![],
            Default::default(),
            EngineCtx::new(
                registry,
                EventBus::new(),
                CancellationToken::new(),
                PathBuf::from("."),
            ),
        )
    }

    #[tokio::test]
    async fn serves_router_routes_over_tcp() {
        let registry = Arc::new(ServiceRegistry::new());
        let router_module = HttpRouterModule::new("api");
        registry
            .register(
                "api".to_string(),
                router_module.inner() as Arc<dyn RouterService>,
            )
            .unwrap();
        router_module
            .inner()
            .add_route(RouteSpec::new(axum::http::Method::GET, "/ping", Arc::new(Pong)))
            .unwrap();

        let server = HttpServerModule::new("web");
        // Port 0 binds an ephemeral port.
        let module_ctx = ctx(
            registry.clone(),
            serde_json::json!({ "addr": "127.0.0.1:0" }),
        );
        server.init(&module_ctx).await.unwrap();
        server.wire(&module_ctx).unwrap();

        let cancel = CancellationToken::new();
        server.start(cancel.clone()).await.unwrap();

        cancel.cancel();
        server.stop(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_addr_fails_init() {
        let registry = Arc::new(ServiceRegistry::new());
        let server = HttpServerModule::new("web");
        let module_ctx = ctx(registry, serde_json::json!({ "addr": "not-an-addr" }));
        assert!(server.init(&module_ctx).await.is_err());
    }

    #[tokio::test]
    async fn start_without_router_fails() {
        let registry = Arc::new(ServiceRegistry::new());
        let server = HttpServerModule::new("web");
        let module_ctx = ctx(registry, serde_json::Value::Null);
        server.init(&module_ctx).await.unwrap();

        let err = server.start(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("no router wired"));
    }
}
