//! The `log.collector` module: serves recent log records captured by the
//! bootstrap [`LogBuffer`] layer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Query, Request};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::info;

use flowkit::{Module, ModuleCtx, WireableModule};
use flowkit_bootstrap::LogBuffer;

use crate::capabilities::{HttpHandler, RouteSpec};
use crate::wiring::select_router_without_route;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogCollectorConfig {
    #[serde(default)]
    pub router: Option<String>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_path() -> String {
    "/logs".to_string()
}
fn default_limit() -> usize {
    100
}

impl Default for LogCollectorConfig {
    fn default() -> Self {
        Self {
            router: None,
            path: default_path(),
            limit: default_limit(),
        }
    }
}

struct LogsEndpoint {
    buffer: LogBuffer,
    default_limit: usize,
}

#[async_trait]
impl HttpHandler for LogsEndpoint {
    async fn handle(&self, req: Request) -> Response {
        let limit = Query::<HashMap<String, String>>::try_from_uri(req.uri())
            .ok()
            .and_then(|Query(q)| q.get("limit").and_then(|v| v.parse::<usize>().ok()))
            .unwrap_or(self.default_limit);
        axum::Json(self.buffer.recent(limit)).into_response()
    }
}

pub struct LogCollectorModule {
    name: String,
    buffer: LogBuffer,
    config: parking_lot::RwLock<LogCollectorConfig>,
}

impl LogCollectorModule {
    /// The buffer is created before logging init and shared with the
    /// subscriber layer; this module only serves it.
    pub fn new(name: &str, buffer: LogBuffer) -> Self {
        Self {
            name: name.to_string(),
            buffer,
            config: parking_lot::RwLock::new(LogCollectorConfig::default()),
        }
    }
}

#[async_trait]
impl Module for LogCollectorModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        *self.config.write() = ctx.config()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_wireable(&self) -> Option<&dyn WireableModule> {
        Some(self)
    }
}

impl WireableModule for LogCollectorModule {
    fn wire(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg = self.config.read().clone();
        let (router_name, router) =
            select_router_without_route(ctx, cfg.router.as_deref(), &Method::GET, &cfg.path)?;
        if !router.has_route(&Method::GET, &cfg.path) {
            router.add_route(RouteSpec::new(
                Method::GET,
                cfg.path.clone(),
                Arc::new(LogsEndpoint {
                    buffer: self.buffer.clone(),
                    default_limit: cfg.limit,
                }) as Arc<dyn HttpHandler>,
            ))?;
            info!(module = %self.name, router = %router_name, path = %cfg.path, "Log endpoint registered");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::RouterService;
    use crate::router::HttpRouterModule;
    use flowkit::{EngineCtx, EventBus, ServiceRegistry};
    use flowkit_bootstrap::LogRecord;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    #[tokio::test]
    async fn serves_recent_records_with_limit() {
        let buffer = LogBuffer::new(16);
        for n in 0..4 {
            buffer.push(LogRecord {
                at: chrono::Utc::now(),
                level: "INFO".into(),
                target: "t".into(),
                message: format!("m{n}"),
            });
        }

        let registry = Arc::new(ServiceRegistry::new());
        let router = HttpRouterModule::new("api");
        registry
            .register("api".to_string(), router.inner() as Arc<dyn RouterService>)
            .unwrap();

        let module = LogCollectorModule::new("logs", buffer);
        let ctx = ModuleCtx::new(
            "logs",
            serde_json::Value::Null,
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
                axum::http::Request::get("/logs?limit=2")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let bytes = axum::body::to_bytes(resp.into_body(), 65536).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v.as_array().unwrap().len(), 2);
        assert_eq!(v[0]["message"], "m2");
        assert_eq!(v[1]["message"], "m3");
    }
}
