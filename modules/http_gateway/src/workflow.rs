//! Workflow handler for the `http` kind: reads `routes[]` and registers
//! composed middleware chains on the named router.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::Method;
use serde::Deserialize;
use tracing::info;

use flowkit::{EngineCtx, ErrorKind, JsonMap, WorkflowError, WorkflowHandler};

use crate::capabilities::{HttpHandler, HttpMiddleware, RouteSpec, RouterService};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Section {
    #[serde(default)]
    router: Option<String>,
    #[serde(default)]
    routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteConfig {
    method: String,
    path: String,
    handler: String,
    #[serde(default)]
    middlewares: Vec<String>,
    #[serde(default)]
    router: Option<String>,
}

/// Claims the `http` kind. Traffic flows through the router, not through
/// `TriggerWorkflow`; `execute` only reports that.
#[derive(Default)]
pub struct HttpWorkflowHandler;

impl HttpWorkflowHandler {
    pub fn new() -> Self {
        Self
    }

    fn resolve_router(
        ctx: &EngineCtx,
        explicit: Option<&str>,
    ) -> anyhow::Result<(String, Arc<dyn RouterService>)> {
        if let Some(name) = explicit {
            let router: Arc<dyn RouterService> = ctx.registry().get(name)?;
            return Ok((name.to_string(), router));
        }
        let mut available = ctx.registry().all_of::<Arc<dyn RouterService>>();
        match available.len() {
            0 => anyhow::bail!("http workflow requires an 'http.router' module"),
            1 => Ok(available.remove(0)),
            n => anyhow::bail!("{n} routers published; set 'router' to pick one"),
        }
    }
}

#[async_trait]
impl WorkflowHandler for HttpWorkflowHandler {
    fn can_handle(&self, kind: &str) -> bool {
        kind == "http"
    }

    async fn configure(&self, section: &serde_json::Value, ctx: &EngineCtx) -> anyhow::Result<()> {
        let section: Section = serde_json::from_value(section.clone())?;

        for route in &section.routes {
            let method: Method = route
                .method
                .to_uppercase()
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid method '{}'", route.method))?;

            let handler: Arc<dyn HttpHandler> = ctx.registry().get(&route.handler)?;

            let mut middlewares = Vec::with_capacity(route.middlewares.len());
            for name in &route.middlewares {
                let mw: Arc<dyn HttpMiddleware> = ctx.registry().get(name)?;
                middlewares.push(mw);
            }

            let explicit = route.router.as_deref().or(section.router.as_deref());
            let (router_name, router) = Self::resolve_router(ctx, explicit)?;
            router.add_route(
                RouteSpec::new(method.clone(), route.path.clone(), handler)
                    .with_middlewares(middlewares),
            )?;
            info!(
                router = %router_name,
                method = %method,
                path = %route.path,
                handler = %route.handler,
                "HTTP workflow route configured"
            );
        }
        Ok(())
    }

    async fn execute(&self, _kind: &str, action: &str, _data: JsonMap) -> anyhow::Result<JsonMap> {
        Err(WorkflowError::new(
            ErrorKind::Permanent,
            format!("http workflows serve through the router; action '{action}' is not invokable"),
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::StaticResponseHandler;
    use crate::router::HttpRouterModule;
    use flowkit::{EventBus, ServiceRegistry};
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    fn engine_ctx(registry: Arc<ServiceRegistry>) -> EngineCtx {
        EngineCtx::new(
            registry,
            EventBus::new(),
            CancellationToken::new(),
            PathBuf::from("."),
        )
    }

    #[tokio::test]
    async fn configures_routes_from_section() {
        let registry = Arc::new(ServiceRegistry::new());
        let router = HttpRouterModule::new("api");
        registry
            .register("api".to_string(), router.inner() as Arc<dyn RouterService>)
            .unwrap();
        registry
            .register(
                "pong",
                Arc::new(StaticResponseHandler::ok()) as Arc<dyn HttpHandler>,
            )
            .unwrap();

        let handler = HttpWorkflowHandler::new();
        handler
            .configure(
                &serde_json::json!({
                    "routes": [
                        { "method": "get", "path": "/ping", "handler": "pong" }
                    ]
                }),
                &engine_ctx(registry),
            )
            .await
            .unwrap();

        assert!(router.inner().has_route(&Method::GET, "/ping"));
    }

    #[tokio::test]
    async fn unknown_handler_fails_configuration() {
        let registry = Arc::new(ServiceRegistry::new());
        let router = HttpRouterModule::new("api");
        registry
            .register("api".to_string(), router.inner() as Arc<dyn RouterService>)
            .unwrap();

        let handler = HttpWorkflowHandler::new();
        let err = handler
            .configure(
                &serde_json::json!({
                    "routes": [ { "method": "GET", "path": "/x", "handler": "ghost" } ]
                }),
                &engine_ctx(registry),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn execute_reports_not_invokable() {
        let handler = HttpWorkflowHandler::new();
        let err = handler
            .execute("http", "anything", JsonMap::new())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<WorkflowError>().is_some());
    }
}
