//! Built-in middleware modules. Each publishes an [`HttpMiddleware`] under
//! its module name; chains are assembled per route by the HTTP workflow
//! handler.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::info;

use flowkit::{Module, ModuleCtx};

use crate::capabilities::HttpMiddleware;

/// Declares a module that only publishes one middleware object.
macro_rules! middleware_module {
    ($module:ident, $config:ty, $build:expr) => {
        pub struct $module {
            name: String,
        }

        impl $module {
            pub fn new(name: &str) -> Self {
                Self {
                    name: name.to_string(),
                }
            }
        }

        #[async_trait]
        impl Module for $module {
            fn name(&self) -> &str {
                &self.name
            }

            async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
                let cfg: $config = ctx.config()?;
                #[allow(clippy::redundant_closure_call)]
                let mw: Arc<dyn HttpMiddleware> = ($build)(cfg)?;
                ctx.registry().register(self.name.clone(), mw)?;
                Ok(())
            }

            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
    };
}

// ---------------- request logging ----------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {}

struct RequestLogging;

#[async_trait]
impl HttpMiddleware for RequestLogging {
    async fn handle(&self, req: Request, next: Next) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let started = Instant::now();

        let resp = next.run(req).await;

        let latency_ms = (started.elapsed().as_secs_f64() * 1000.0) as u64;
        info!(
            %method,
            path = %path,
            status = resp.status().as_u16(),
            latency_ms,
            "http_request"
        );
        resp
    }
}

middleware_module!(LoggingMiddlewareModule, LoggingConfig, |_cfg| {
    anyhow::Ok(Arc::new(RequestLogging) as Arc<dyn HttpMiddleware>)
});

// ---------------- request id ----------------

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestIdConfig {}

struct RequestId;

#[async_trait]
impl HttpMiddleware for RequestId {
    async fn handle(&self, mut req: Request, next: Next) -> Response {
        let header_name = HeaderName::from_static(REQUEST_ID_HEADER);
        let id = match req.headers().get(&header_name) {
            Some(existing) => existing.clone(),
            None => {
                let generated = uuid::Uuid::new_v4().to_string();
                let value = HeaderValue::from_str(&generated)
                    .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
                req.headers_mut().insert(header_name.clone(), value.clone());
                value
            }
        };

        let mut resp = next.run(req).await;
        resp.headers_mut().insert(header_name, id);
        resp
    }
}

middleware_module!(RequestIdMiddlewareModule, RequestIdConfig, |_cfg| {
    anyhow::Ok(Arc::new(RequestId) as Arc<dyn HttpMiddleware>)
});

// ---------------- CORS ----------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsConfig {
    #[serde(default = "default_origins", rename = "allowedOrigins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_methods", rename = "allowedMethods")]
    pub allowed_methods: Vec<String>,
    #[serde(default = "default_headers", rename = "allowedHeaders")]
    pub allowed_headers: Vec<String>,
}

fn default_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_headers() -> Vec<String> {
    vec!["content-type".to_string(), "authorization".to_string()]
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_origins(),
            allowed_methods: default_methods(),
            allowed_headers: default_headers(),
        }
    }
}

struct Cors {
    cfg: CorsConfig,
}

impl Cors {
    fn origin_for(&self, req_origin: Option<&HeaderValue>) -> Option<HeaderValue> {
        if self.cfg.allowed_origins.iter().any(|o| o == "*") {
            return Some(HeaderValue::from_static("*"));
        }
        let origin = req_origin?.to_str().ok()?;
        self.cfg
            .allowed_origins
            .iter()
            .find(|allowed| allowed.as_str() == origin)
            .and_then(|allowed| HeaderValue::from_str(allowed).ok())
    }
}

#[async_trait]
impl HttpMiddleware for Cors {
    async fn handle(&self, req: Request, next: Next) -> Response {
        let allow_origin = self.origin_for(req.headers().get(header::ORIGIN));

        // Preflight short-circuits before any downstream middleware.
        if req.method() == Method::OPTIONS {
            let mut resp = StatusCode::NO_CONTENT.into_response();
            if let Some(origin) = allow_origin {
                let headers = resp.headers_mut();
                headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
                if let Ok(methods) = HeaderValue::from_str(&self.cfg.allowed_methods.join(", ")) {
                    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, methods);
                }
                if let Ok(allowed) = HeaderValue::from_str(&self.cfg.allowed_headers.join(", ")) {
                    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allowed);
                }
            }
            return resp;
        }

        let mut resp = next.run(req).await;
        if let Some(origin) = allow_origin {
            resp.headers_mut()
                .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        resp
    }
}

middleware_module!(CorsMiddlewareModule, CorsConfig, |cfg| {
    anyhow::Ok(Arc::new(Cors { cfg }) as Arc<dyn HttpMiddleware>)
});

// ---------------- rate limiting ----------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_rps")]
    pub rps: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_rps() -> u32 {
    50
}
fn default_burst() -> u32 {
    100
}

struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rps: u32, burst: u32) -> Self {
        let cap = burst.max(rps).max(1);
        Self {
            capacity: cap,
            tokens: cap as f64,
            refill_per_sec: rps.max(1) as f64,
            last: Instant::now(),
        }
    }

    fn allow_now(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity as f64);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct RateLimit {
    bucket: Mutex<TokenBucket>,
}

#[async_trait]
impl HttpMiddleware for RateLimit {
    async fn handle(&self, req: Request, next: Next) -> Response {
        let allowed = self.bucket.lock().allow_now();
        if !allowed {
            return StatusCode::TOO_MANY_REQUESTS.into_response();
        }
        next.run(req).await
    }
}

middleware_module!(RateLimitMiddlewareModule, RateLimitConfig, |cfg: RateLimitConfig| {
    anyhow::Ok(Arc::new(RateLimit {
        bucket: Mutex::new(TokenBucket::new(cfg.rps, cfg.burst)),
    }) as Arc<dyn HttpMiddleware>)
});

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rps: default_rps(),
            burst: default_burst(),
        }
    }
}

// ---------------- security headers ----------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityHeadersConfig {}

struct SecurityHeaders;

#[async_trait]
impl HttpMiddleware for SecurityHeaders {
    async fn handle(&self, req: Request, next: Next) -> Response {
        let mut resp = next.run(req).await;
        let headers = resp.headers_mut();
        headers.insert(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        );
        headers.insert(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        );
        headers.insert(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        );
        resp
    }
}

middleware_module!(SecurityHeadersMiddlewareModule, SecurityHeadersConfig, |_cfg| {
    anyhow::Ok(Arc::new(SecurityHeaders) as Arc<dyn HttpMiddleware>)
});
