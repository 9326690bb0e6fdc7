//! Router selection for the post-init wiring pass.
//!
//! Precedence: explicit name > a router among `dependsOn` > the router of a
//! server among `dependsOn` > the first available router.

use std::sync::Arc;

use parking_lot::RwLock;

use flowkit::ModuleCtx;

use crate::capabilities::RouterService;

/// Published by `http.server` modules so dependents can find the router a
/// server was wired to.
#[derive(Clone, Default)]
pub struct ServerBinding {
    router: Arc<RwLock<Option<String>>>,
}

impl ServerBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_router(&self, name: impl Into<String>) {
        *self.router.write() = Some(name.into());
    }

    pub fn router_name(&self) -> Option<String> {
        self.router.read().clone()
    }
}

/// Resolve the router a module should attach to.
pub fn select_router(
    ctx: &ModuleCtx,
    explicit: Option<&str>,
) -> anyhow::Result<(String, Arc<dyn RouterService>)> {
    let registry = ctx.registry();

    if let Some(name) = explicit {
        let router: Arc<dyn RouterService> = registry.get(name)?;
        return Ok((name.to_string(), router));
    }

    for dep in ctx.depends_on() {
        if let Ok(router) = registry.get::<Arc<dyn RouterService>>(dep) {
            return Ok((dep.clone(), router));
        }
    }

    for dep in ctx.depends_on() {
        if let Ok(binding) = registry.get::<ServerBinding>(dep) {
            if let Some(router_name) = binding.router_name() {
                if let Ok(router) = registry.get::<Arc<dyn RouterService>>(&router_name) {
                    return Ok((router_name, router));
                }
            }
        }
    }

    let mut available = registry.all_of::<Arc<dyn RouterService>>();
    if available.is_empty() {
        anyhow::bail!("module '{}' needs a router but none is available", ctx.name());
    }
    Ok(available.remove(0))
}

/// First router (by name) that does not yet serve `method path`; falls back
/// to the standard selection when every router already has it.
pub fn select_router_without_route(
    ctx: &ModuleCtx,
    explicit: Option<&str>,
    method: &axum::http::Method,
    path: &str,
) -> anyhow::Result<(String, Arc<dyn RouterService>)> {
    if explicit.is_some() {
        return select_router(ctx, explicit);
    }
    for (name, router) in ctx.registry().all_of::<Arc<dyn RouterService>>() {
        if !router.has_route(method, path) {
            return Ok((name, router));
        }
    }
    select_router(ctx, None)
}
