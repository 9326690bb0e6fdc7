//! The `metrics.collector` module: serves the shared prometheus registry
//! as `/metrics` text.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use prometheus::Encoder;
use serde::Deserialize;
use tracing::info;

use flowkit::{wellknown, Module, ModuleCtx, WireableModule, WorkflowMetrics};

use crate::capabilities::{HttpHandler, RouteSpec};
use crate::wiring::select_router_without_route;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsCollectorConfig {
    #[serde(default)]
    pub router: Option<String>,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/metrics".to_string()
}

struct MetricsEndpoint {
    metrics: Arc<WorkflowMetrics>,
}

#[async_trait]
impl HttpHandler for MetricsEndpoint {
    async fn handle(&self, _req: Request) -> Response {
        let families = self.metrics.registry().gather();
        let mut buf = Vec::new();
        if let Err(e) = prometheus::TextEncoder::new().encode(&families, &mut buf) {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
        (
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            buf,
        )
            .into_response()
    }
}

pub struct MetricsCollectorModule {
    name: String,
    config: parking_lot::RwLock<MetricsCollectorConfig>,
}

impl MetricsCollectorModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: parking_lot::RwLock::new(MetricsCollectorConfig {
                router: None,
                path: default_path(),
            }),
        }
    }
}

#[async_trait]
impl Module for MetricsCollectorModule {
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

impl WireableModule for MetricsCollectorModule {
    fn wire(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg = self.config.read().clone();
        let metrics: Arc<WorkflowMetrics> = ctx.registry().get(wellknown::METRICS_REGISTRY)?;

        let (router_name, router) =
            select_router_without_route(ctx, cfg.router.as_deref(), &Method::GET, &cfg.path)?;
        if !router.has_route(&Method::GET, &cfg.path) {
            router.add_route(RouteSpec::new(
                Method::GET,
                cfg.path.clone(),
                Arc::new(MetricsEndpoint { metrics }) as Arc<dyn HttpHandler>,
            ))?;
            info!(module = %self.name, router = %router_name, path = %cfg.path, "Metrics endpoint registered");
        }
        Ok(())
    }
}
