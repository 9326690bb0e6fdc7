//! The `health.checker` module: serves `/healthz`, `/readyz` and `/livez`
//! on the first router that does not already carry them.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::info;

use flowkit::{wellknown, HealthRegistry, HealthStatus, Module, ModuleCtx, WireableModule};

use crate::capabilities::{HttpHandler, RouteSpec};
use crate::wiring::select_router_without_route;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckerConfig {
    #[serde(default)]
    pub router: Option<String>,
}

#[derive(Clone, Copy)]
enum Endpoint {
    Healthz,
    Readyz,
    Livez,
}

struct HealthEndpoint {
    registry: HealthRegistry,
    endpoint: Endpoint,
}

#[async_trait]
impl HttpHandler for HealthEndpoint {
    async fn handle(&self, _req: Request) -> Response {
        match self.endpoint {
            Endpoint::Livez => {
                axum::Json(serde_json::json!({ "status": "healthy", "checks": [] }))
                    .into_response()
            }
            Endpoint::Readyz | Endpoint::Healthz => {
                let report = self.registry.report();
                let status = match report.status {
                    HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
                    HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
                };
                (status, axum::Json(report)).into_response()
            }
        }
    }
}

pub struct HealthCheckerModule {
    name: String,
    config: parking_lot::RwLock<HealthCheckerConfig>,
}

impl HealthCheckerModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: parking_lot::RwLock::new(HealthCheckerConfig::default()),
        }
    }
}

#[async_trait]
impl Module for HealthCheckerModule {
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

impl WireableModule for HealthCheckerModule {
    fn wire(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg = self.config.read().clone();
        let health: HealthRegistry = ctx.registry().get(wellknown::HEALTH_REGISTRY)?;

        for (path, endpoint) in [
            ("/healthz", Endpoint::Healthz),
            ("/readyz", Endpoint::Readyz),
            ("/livez", Endpoint::Livez),
        ] {
            let (router_name, router) =
                select_router_without_route(ctx, cfg.router.as_deref(), &Method::GET, path)?;
            if router.has_route(&Method::GET, path) {
                continue;
            }
            router.add_route(RouteSpec::new(
                Method::GET,
                path,
                Arc::new(HealthEndpoint {
                    registry: health.clone(),
                    endpoint,
                }) as Arc<dyn HttpHandler>,
            ))?;
            info!(module = %self.name, router = %router_name, path, "Health endpoint registered");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::RouterService;
    use crate::router::HttpRouterModule;
    use flowkit::{EngineCtx, EventBus, HealthCheck, ServiceRegistry};
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    async fn serve(registry: &Arc<ServiceRegistry>, path: &str) -> (StatusCode, serde_json::Value) {
        let router: Arc<dyn RouterService> = registry.get("api").unwrap();
        let resp = router
            .build()
            .oneshot(
                axum::http::Request::get(path)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 16384).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn serves_health_report() {
        let registry = Arc::new(ServiceRegistry::new());
        let health = HealthRegistry::new();
        health.add_check(|| HealthCheck::degraded("store", "slow saves"));
        registry
            .register(wellknown::HEALTH_REGISTRY, health)
            .unwrap();

        let router = HttpRouterModule::new("api");
        registry
            .register("api".to_string(), router.inner() as Arc<dyn RouterService>)
            .unwrap();

        let module = HealthCheckerModule::new("health");
        let ctx = ModuleCtx::new(
            "health",
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

        let (status, body) = serve(&registry, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["checks"][0]["name"], "store");

        let (status, body) = serve(&registry, "/livez").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn unhealthy_reports_503_on_readyz() {
        let registry = Arc::new(ServiceRegistry::new());
        let health = HealthRegistry::new();
        health.add_check(|| HealthCheck::unhealthy("db", "unreachable"));
        registry
            .register(wellknown::HEALTH_REGISTRY, health)
            .unwrap();

        let router = HttpRouterModule::new("api");
        registry
            .register("api".to_string(), router.inner() as Arc<dyn RouterService>)
            .unwrap();

        let module = HealthCheckerModule::new("health");
        let ctx = ModuleCtx::new(
            "health",
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

        let (status, body) = serve(&registry, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
    }
}
