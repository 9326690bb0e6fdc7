//! The `static.fileserver` module: serves a directory under a route
//! prefix, wired to a router by the standard precedence.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::info;

use flowkit::{Module, ModuleCtx, WireableModule};

use crate::capabilities::{HttpHandler, RouteSpec};
use crate::wiring::select_router;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticFileServerConfig {
    /// Directory to serve, resolved against the config file's directory.
    pub dir: String,
    #[serde(default = "default_prefix", rename = "routePrefix")]
    pub route_prefix: String,
    #[serde(default)]
    pub router: Option<String>,
}

fn default_prefix() -> String {
    "/static".to_string()
}

struct StaticFilesHandler {
    serve_dir: ServeDir,
    prefix: String,
}

#[async_trait]
impl HttpHandler for StaticFilesHandler {
    async fn handle(&self, req: Request) -> Response {
        // The route matches `<prefix>/{*path}`; ServeDir expects the path
        // relative to the prefix.
        let path = req.uri().path();
        let relative = path
            .strip_prefix(self.prefix.as_str())
            .unwrap_or(path)
            .to_string();
        let relative = if relative.is_empty() {
            "/".to_string()
        } else {
            relative
        };

        let uri: Uri = match relative.parse() {
            Ok(uri) => uri,
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        };
        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        let req = Request::from_parts(parts, body);

        match self.serve_dir.clone().oneshot(req).await {
            Ok(resp) => resp.map(axum::body::Body::new),
            Err(infallible) => match infallible {},
        }
    }
}

pub struct StaticFileServerModule {
    name: String,
    state: parking_lot::RwLock<Option<(StaticFileServerConfig, PathBuf)>>,
}

impl StaticFileServerModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: parking_lot::RwLock::new(None),
        }
    }
}

#[async_trait]
impl Module for StaticFileServerModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg: StaticFileServerConfig = ctx.config()?;
        let dir = ctx.resolve_path(&cfg.dir);
        if !dir.is_dir() {
            anyhow::bail!(
                "static file server '{}': '{}' is not a directory",
                self.name,
                dir.display()
            );
        }
        *self.state.write() = Some((cfg, dir));
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_wireable(&self) -> Option<&dyn WireableModule> {
        Some(self)
    }
}

impl WireableModule for StaticFileServerModule {
    fn wire(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let (cfg, dir) = self
            .state
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("static file server '{}' not initialized", self.name))?;

        let (router_name, router) = select_router(ctx, cfg.router.as_deref())?;

        let prefix = cfg.route_prefix.trim_end_matches('/').to_string();
        let handler = Arc::new(StaticFilesHandler {
            serve_dir: ServeDir::new(&dir),
            prefix: prefix.clone(),
        }) as Arc<dyn HttpHandler>;

        router.add_route(RouteSpec::new(
            Method::GET,
            format!("{prefix}/{{*path}}"),
            handler,
        ))?;
        info!(
            module = %self.name,
            router = %router_name,
            dir = %dir.display(),
            prefix = %prefix,
            "Static file server wired"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::RouterService;
    use crate::router::HttpRouterModule;
    use flowkit::{EngineCtx, EventBus, ServiceRegistry};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn serves_files_under_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hi there").unwrap();

        let registry = Arc::new(ServiceRegistry::new());
        let router = HttpRouterModule::new("api");
        registry
            .register("api".to_string(), router.inner() as Arc<dyn RouterService>)
            .unwrap();

        let module = StaticFileServerModule::new("assets");
        let ctx = ModuleCtx::new(
            "assets",
            serde_json::json!({ "dir": dir.path().to_str().unwrap() }),
            vec![],
            Default::default(),
            EngineCtx::new(
                registry.clone(),
                EventBus::new(),
                CancellationToken::new(),
                PathBuf::from("."),
            ),
        );
        module.init(&ctx).await.unwrap();
        module.wire(&ctx).unwrap();

        let svc: Arc<dyn RouterService> = registry.get("api").unwrap();
        let resp = svc
            .build()
            .oneshot(
                axum::http::Request::get("/static/hello.txt")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
        assert_eq!(&bytes[..], b"hi there");
    }

    #[tokio::test]
    async fn missing_directory_fails_init() {
        let registry = Arc::new(ServiceRegistry::new());
        let module = StaticFileServerModule::new("assets");
        let ctx = ModuleCtx::new(
            "assets",
            serde_json::json!({ "dir": "/definitely/not/here" }),
            vec![],
            Default::default(),
            EngineCtx::new(
                registry,
                EventBus::new(),
                CancellationToken::new(),
                PathBuf::from("."),
            ),
        );
        assert!(module.init(&ctx).await.is_err());
    }
}
