//! HTTP trigger: a configured method + path that fires a workflow on the
//! engine and serializes the result as JSON.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use flowkit::{Trigger, TriggerCtx, WorkflowDispatcher};

use crate::capabilities::{error_response, HttpHandler, RouteSpec, RouterService};
use crate::handlers::request_params;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpTriggerConfig {
    pub method: String,
    pub path: String,
    #[serde(rename = "workflowType")]
    pub workflow_type: String,
    pub action: String,
    #[serde(default)]
    pub router: Option<String>,
}

struct TriggerEndpoint {
    dispatcher: Arc<dyn WorkflowDispatcher>,
    workflow_type: String,
    action: String,
}

#[async_trait]
impl HttpHandler for TriggerEndpoint {
    async fn handle(&self, req: Request) -> Response {
        let data = match request_params(req).await {
            Ok(params) => params,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        };

        match self
            .dispatcher
            .trigger_workflow(&self.workflow_type, &self.action, data)
            .await
        {
            Ok(result) => axum::Json(serde_json::Value::Object(result)).into_response(),
            Err(e) => error_response(&e),
        }
    }
}

/// The trigger itself holds no loop — the route lives in the router and
/// the server drives it. Start/stop are bookkeeping only.
pub struct HttpTrigger {
    name: String,
}

impl HttpTrigger {
    /// Validate the config and register the route; called by the trigger
    /// factory during build, when the registry is complete.
    pub fn from_config(cfg: &serde_json::Value, ctx: &TriggerCtx) -> anyhow::Result<Arc<dyn Trigger>> {
        let cfg: HttpTriggerConfig = serde_json::from_value(cfg.clone())?;
        let method: Method = cfg
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid trigger method '{}'", cfg.method))?;
        if !cfg.path.starts_with('/') {
            anyhow::bail!("trigger path '{}' must start with '/'", cfg.path);
        }

        let router: Arc<dyn RouterService> = match &cfg.router {
            Some(name) => ctx.registry().get(name)?,
            None => {
                let mut available = ctx.registry().all_of::<Arc<dyn RouterService>>();
                if available.is_empty() {
                    anyhow::bail!("http trigger requires an 'http.router' module");
                }
                available.remove(0).1
            }
        };

        let endpoint = Arc::new(TriggerEndpoint {
            dispatcher: ctx.dispatcher(),
            workflow_type: cfg.workflow_type.clone(),
            action: cfg.action.clone(),
        }) as Arc<dyn HttpHandler>;
        router.add_route(RouteSpec::new(method.clone(), cfg.path.clone(), endpoint))?;

        let name = format!("http:{} {}", method, cfg.path);
        info!(trigger = %name, workflow = %cfg.workflow_type, action = %cfg.action, "HTTP trigger configured");
        Ok(Arc::new(HttpTrigger { name }))
    }
}

#[async_trait]
impl Trigger for HttpTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::HttpRouterModule;
    use flowkit::{EngineCtx, ErrorKind, EventBus, JsonMap, ServiceRegistry, WorkflowError};
    use std::path::PathBuf;
    use tower::ServiceExt;

    struct StubDispatcher;

    #[async_trait]
    impl WorkflowDispatcher for StubDispatcher {
        async fn trigger_workflow(
            &self,
            kind: &str,
            action: &str,
            data: JsonMap,
        ) -> anyhow::Result<JsonMap> {
            if data.get("id").and_then(|v| v.as_str()) == Some("bad") {
                return Err(WorkflowError::new(
                    ErrorKind::InvalidTransition,
                    "already finished",
                )
                .into());
            }
            let mut out = JsonMap::new();
            out.insert("kind".to_string(), serde_json::json!(kind));
            out.insert("action".to_string(), serde_json::json!(action));
            out.insert("state".to_string(), serde_json::json!("done"));
            Ok(out)
        }
    }

    fn trigger_ctx(registry: Arc<ServiceRegistry>) -> TriggerCtx {
        TriggerCtx::new(
            Arc::new(StubDispatcher),
            EngineCtx::new(
                registry,
                EventBus::new(),
                tokio_util::sync::CancellationToken::new(),
                PathBuf::from("."),
            ),
        )
    }

    #[tokio::test]
    async fn fires_workflow_and_returns_json() {
        let registry = Arc::new(ServiceRegistry::new());
        let router = HttpRouterModule::new("api");
        registry
            .register("api".to_string(), router.inner() as Arc<dyn RouterService>)
            .unwrap();

        let trigger = HttpTrigger::from_config(
            &serde_json::json!({
                "method": "POST",
                "path": "/go",
                "workflowType": "statemachine",
                "action": "finish"
            }),
            &trigger_ctx(registry),
        )
        .unwrap();
        assert_eq!(trigger.name(), "http:POST /go");

        let resp = router
            .inner()
            .build()
            .oneshot(
                axum::http::Request::post("/go")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"id": "inst-1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["state"], "done");
        assert_eq!(v["kind"], "statemachine");
        assert_eq!(v["action"], "finish");
    }

    #[tokio::test]
    async fn kinded_failure_maps_to_4xx_body() {
        let registry = Arc::new(ServiceRegistry::new());
        let router = HttpRouterModule::new("api");
        registry
            .register("api".to_string(), router.inner() as Arc<dyn RouterService>)
            .unwrap();

        HttpTrigger::from_config(
            &serde_json::json!({
                "method": "POST",
                "path": "/go",
                "workflowType": "statemachine",
                "action": "finish"
            }),
            &trigger_ctx(registry),
        )
        .unwrap();

        let resp = router
            .inner()
            .build()
            .oneshot(
                axum::http::Request::post("/go")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"id": "bad"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let bytes = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["error"], "invalid_transition");
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let registry = Arc::new(ServiceRegistry::new());
        let router = HttpRouterModule::new("api");
        registry
            .register("api".to_string(), router.inner() as Arc<dyn RouterService>)
            .unwrap();

        let result = HttpTrigger::from_config(
            &serde_json::json!({
                "method": "POST",
                "path": "no-slash",
                "workflowType": "x",
                "action": "y"
            }),
            &trigger_ctx(registry),
        );
        let Err(err) = result else {
            panic!("expected an error");
        };
        assert!(err.to_string().contains("must start with"));
    }
}
