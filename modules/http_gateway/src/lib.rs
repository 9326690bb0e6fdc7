//! HTTP gateway: servers, routers, handlers, middleware chains, built-in
//! observability endpoints, the `http` workflow handler and the HTTP
//! trigger.

pub mod capabilities;
pub mod handlers;
pub mod health;
pub mod logs;
pub mod metrics;
pub mod middleware;
pub mod router;
pub mod server;
pub mod static_files;
pub mod trigger;
pub mod wiring;
pub mod workflow;

pub use capabilities::{error_response, HttpHandler, HttpMiddleware, RouteSpec, RouterService};
pub use handlers::{HttpHandlerModule, SimpleProxyModule, StaticResponseHandler};
pub use health::HealthCheckerModule;
pub use logs::LogCollectorModule;
pub use metrics::MetricsCollectorModule;
pub use middleware::{
    CorsMiddlewareModule, LoggingMiddlewareModule, RateLimitMiddlewareModule,
    RequestIdMiddlewareModule, SecurityHeadersMiddlewareModule,
};
pub use router::{HttpRouterModule, SharedRouter};
pub use server::HttpServerModule;
pub use static_files::StaticFileServerModule;
pub use trigger::HttpTrigger;
pub use wiring::{select_router, select_router_without_route, ServerBinding};
pub use workflow::HttpWorkflowHandler;

use std::sync::Arc;

use flowkit::{Module, ModuleFactory, TriggerFactory};
use flowkit_bootstrap::LogBuffer;

/// Register this crate's module types with the engine factory.
///
/// `log.collector` needs the shared [`LogBuffer`] created before logging
/// init; register it separately with [`register_log_collector`].
pub fn register_module_types(factory: &mut ModuleFactory) {
    factory.register("http.server", |cfg| {
        Ok(Arc::new(HttpServerModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("http.router", |cfg| {
        Ok(Arc::new(HttpRouterModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("http.handler", |cfg| {
        Ok(Arc::new(HttpHandlerModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("http.simple_proxy", |cfg| {
        Ok(Arc::new(SimpleProxyModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("http.middleware.logging", |cfg| {
        Ok(Arc::new(LoggingMiddlewareModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("http.middleware.requestid", |cfg| {
        Ok(Arc::new(RequestIdMiddlewareModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("http.middleware.cors", |cfg| {
        Ok(Arc::new(CorsMiddlewareModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("http.middleware.ratelimit", |cfg| {
        Ok(Arc::new(RateLimitMiddlewareModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("http.middleware.securityheaders", |cfg| {
        Ok(Arc::new(SecurityHeadersMiddlewareModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("static.fileserver", |cfg| {
        Ok(Arc::new(StaticFileServerModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("health.checker", |cfg| {
        Ok(Arc::new(HealthCheckerModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("metrics.collector", |cfg| {
        Ok(Arc::new(MetricsCollectorModule::new(&cfg.name)) as Arc<dyn Module>)
    });
}

/// Register `log.collector` backed by the buffer shared with the logging
/// subscriber.
pub fn register_log_collector(factory: &mut ModuleFactory, buffer: LogBuffer) {
    factory.register("log.collector", move |cfg| {
        Ok(Arc::new(LogCollectorModule::new(&cfg.name, buffer.clone())) as Arc<dyn Module>)
    });
}

/// Register the HTTP trigger kind.
pub fn register_trigger_kinds(triggers: &mut TriggerFactory) {
    triggers.register("http", HttpTrigger::from_config);
}
