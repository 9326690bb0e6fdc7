use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use flowkit::{ErrorBody, ErrorKind, Module, ModuleCtx, WireableModule};
use http_gateway::HttpMiddleware;

use crate::provider::{AuthProvider, Identity};

/// Request-extension wrapper downstream handlers read the verified
/// identity from.
#[derive(Debug, Clone)]
pub struct AuthIdentity(pub Identity);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthMiddlewareConfig {
    /// Restrict to specific provider service names; empty means every
    /// published provider.
    #[serde(default)]
    pub providers: Vec<String>,
}

struct BearerAuth {
    providers: RwLock<Vec<Arc<dyn AuthProvider>>>,
}

impl BearerAuth {
    fn unauthorized(message: &str) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            axum::Json(ErrorBody::new(ErrorKind::Permanent, message)),
        )
            .into_response()
    }
}

#[async_trait]
impl HttpMiddleware for BearerAuth {
    async fn handle(&self, mut req: Request, next: Next) -> Response {
        let Some(token) = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
        else {
            return Self::unauthorized("missing bearer credentials");
        };

        let providers: Vec<Arc<dyn AuthProvider>> = self.providers.read().clone();
        if providers.is_empty() {
            return Self::unauthorized("no auth providers configured");
        }

        for provider in providers {
            match provider.validate(&token).await {
                Ok(identity) => {
                    debug!(provider = provider.name(), subject = %identity.subject, "Request authenticated");
                    req.extensions_mut().insert(AuthIdentity(identity));
                    return next.run(req).await;
                }
                Err(e) => {
                    debug!(provider = provider.name(), error = %e, "Provider rejected token");
                }
            }
        }
        Self::unauthorized("invalid or expired credentials")
    }
}

/// The `http.middleware.auth` module. Providers are discovered in the
/// post-init wiring pass, after every `auth.*` module has published.
pub struct AuthMiddlewareModule {
    name: String,
    config: RwLock<AuthMiddlewareConfig>,
    auth: Arc<BearerAuth>,
}

impl AuthMiddlewareModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: RwLock::new(AuthMiddlewareConfig::default()),
            auth: Arc::new(BearerAuth {
                providers: RwLock::new(Vec::new()),
            }),
        }
    }
}

#[async_trait]
impl Module for AuthMiddlewareModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        *self.config.write() = ctx.config()?;
        ctx.registry()
            .register(self.name.clone(), self.auth.clone() as Arc<dyn HttpMiddleware>)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_wireable(&self) -> Option<&dyn WireableModule> {
        Some(self)
    }
}

impl WireableModule for AuthMiddlewareModule {
    fn wire(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let wanted = self.config.read().providers.clone();

        let providers: Vec<Arc<dyn AuthProvider>> = if wanted.is_empty() {
            ctx.registry()
                .all_of::<Arc<dyn AuthProvider>>()
                .into_iter()
                .map(|(_, p)| p)
                .collect()
        } else {
            let mut resolved = Vec::with_capacity(wanted.len());
            for name in &wanted {
                resolved.push(ctx.registry().get::<Arc<dyn AuthProvider>>(name)?);
            }
            resolved
        };

        if providers.is_empty() {
            anyhow::bail!(
                "auth middleware '{}' found no auth providers in the registry",
                self.name
            );
        }
        info!(module = %self.name, providers = providers.len(), "Auth providers wired");
        *self.auth.providers.write() = providers;
        Ok(())
    }
}
