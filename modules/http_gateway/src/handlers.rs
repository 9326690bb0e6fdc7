//! Terminal handler modules: `http.handler` (callable-backed or fixed
//! response) and `http.simple_proxy`.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use axum::extract::{Query, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::warn;

use flowkit::{Callable, JsonMap, Module, ModuleCtx, ServiceRegistry};

use crate::capabilities::{error_response, HttpHandler};

/// Decode a request into a callable parameter map: JSON body fields merged
/// with query parameters (body wins on conflict).
pub(crate) async fn request_params(req: Request) -> anyhow::Result<JsonMap> {
    use axum::extract::FromRequestParts;

    let (mut parts, body) = req.into_parts();

    let mut params = JsonMap::new();
    if let Ok(Query(query)) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri) {
        for (k, v) in query {
            params.insert(k, serde_json::Value::String(v));
        }
    }
    if let Ok(raw_params) =
        axum::extract::RawPathParams::from_request_parts(&mut parts, &()).await
    {
        for (k, v) in raw_params.iter() {
            params.insert(k.to_string(), serde_json::Value::String(v.to_string()));
        }
    }

    let bytes = axum::body::to_bytes(body, 2 * 1024 * 1024).await?;
    if !bytes.is_empty() {
        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(serde_json::Value::Object(map)) => {
                for (k, v) in map {
                    params.insert(k, v);
                }
            }
            Ok(other) => {
                params.insert("body".to_string(), other);
            }
            Err(e) => anyhow::bail!("request body is not valid JSON: {e}"),
        }
    }

    Ok(params)
}

fn default_status() -> u16 {
    200
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct HttpHandlerConfig {
    /// Service name of a callable to invoke; mutually exclusive with a
    /// fixed `response`.
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    #[serde(default = "default_status")]
    pub status: u16,
}

struct ConfiguredHandler {
    registry: Arc<ServiceRegistry>,
    cfg: HttpHandlerConfig,
}

#[async_trait]
impl HttpHandler for ConfiguredHandler {
    async fn handle(&self, req: Request) -> Response {
        if let Some(component) = &self.cfg.component {
            let callable: Arc<dyn Callable> = match self.registry.get(component) {
                Ok(c) => c,
                Err(e) => {
                    warn!(component = %component, error = %e, "Handler component missing");
                    let err = anyhow::Error::from(e);
                    return error_response(&err);
                }
            };
            let params = match request_params(req).await {
                Ok(p) => p,
                Err(e) => {
                    return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
                }
            };
            return match callable.execute(params).await {
                Ok(result) => axum::Json(serde_json::Value::Object(result)).into_response(),
                Err(e) => error_response(&e),
            };
        }

        let status =
            StatusCode::from_u16(self.cfg.status).unwrap_or(StatusCode::OK);
        match &self.cfg.response {
            Some(body) => (status, axum::Json(body.clone())).into_response(),
            None => status.into_response(),
        }
    }
}

/// Fixed-response handler, also used by built-in endpoints in tests.
pub struct StaticResponseHandler {
    status: StatusCode,
    body: serde_json::Value,
}

impl StaticResponseHandler {
    pub fn ok() -> Self {
        Self {
            status: StatusCode::OK,
            body: serde_json::json!({"status": "ok"}),
        }
    }
}

#[async_trait]
impl HttpHandler for StaticResponseHandler {
    async fn handle(&self, _req: Request) -> Response {
        (self.status, axum::Json(self.body.clone())).into_response()
    }
}

/// The `http.handler` module.
pub struct HttpHandlerModule {
    name: String,
}

impl HttpHandlerModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Module for HttpHandlerModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg: HttpHandlerConfig = ctx.config()?;
        if cfg.component.is_some() && cfg.response.is_some() {
            anyhow::bail!(
                "handler '{}' sets both 'component' and 'response'",
                self.name
            );
        }
        let handler: Arc<dyn HttpHandler> = Arc::new(ConfiguredHandler {
            registry: ctx.registry().clone(),
            cfg,
        });
        ctx.registry().register(self.name.clone(), handler)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// ---------------- simple proxy ----------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimpleProxyConfig {
    /// Upstream base URL, e.g. `http://127.0.0.1:9000`.
    pub upstream: String,
    #[serde(default = "default_proxy_timeout", rename = "timeoutSecs")]
    pub timeout_secs: u64,
}

fn default_proxy_timeout() -> u64 {
    30
}

struct ProxyHandler {
    upstream: String,
    client: reqwest::Client,
}

#[async_trait]
impl HttpHandler for ProxyHandler {
    async fn handle(&self, req: Request) -> Response {
        let method = req.method().clone();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let url = format!("{}{}", self.upstream.trim_end_matches('/'), path_and_query);

        let content_type = req
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .cloned();
        let body = match axum::body::to_bytes(req.into_body(), 8 * 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        };

        let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
            Ok(m) => m,
            Err(_) => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
        };
        let mut upstream_req = self.client.request(reqwest_method, &url).body(body.to_vec());
        if let Some(ct) = content_type.as_ref().and_then(|v| v.to_str().ok()) {
            upstream_req = upstream_req.header(reqwest::header::CONTENT_TYPE, ct);
        }

        match upstream_req.send().await {
            Ok(upstream_resp) => {
                let status = StatusCode::from_u16(upstream_resp.status().as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                let content_type = upstream_resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                match upstream_resp.bytes().await {
                    Ok(bytes) => {
                        let mut resp = (status, bytes.to_vec()).into_response();
                        if let Some(ct) = content_type.and_then(|ct| {
                            axum::http::HeaderValue::from_str(&ct).ok()
                        }) {
                            resp.headers_mut()
                                .insert(axum::http::header::CONTENT_TYPE, ct);
                        }
                        resp
                    }
                    Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
                }
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Proxy upstream request failed");
                (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
            }
        }
    }
}

/// The `http.simple_proxy` module.
pub struct SimpleProxyModule {
    name: String,
}

impl SimpleProxyModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Module for SimpleProxyModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg: SimpleProxyConfig = ctx.config()?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .build()?;
        let handler: Arc<dyn HttpHandler> = Arc::new(ProxyHandler {
            upstream: cfg.upstream,
            client,
        });
        ctx.registry().register(self.name.clone(), handler)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
