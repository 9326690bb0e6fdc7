//! # FlowKit - Declarative Workflow Orchestration Kernel
//!
//! The kernel assembles heterogeneous modules (HTTP servers, routers,
//! brokers, state machines, schedulers, pipelines) from a single
//! configuration document and coordinates their lifecycle.
//!
//! ## Lifecycle
//!
//! `Engine::build_from_config` drives the build phases:
//! validate → instantiate → init (topological order of `dependsOn`,
//! alphabetical tie-break) → post-init wiring → workflow sections →
//! triggers → pipelines. `Engine::start` starts stateful modules and then
//! triggers; `Engine::stop` tears everything down in reverse.
//!
//! ## Wiring
//!
//! Modules publish named services into the [`ServiceRegistry`] during
//! `init`. Consumers resolve them in the post-init wiring pass, when the
//! registry is guaranteed complete. Optional consumers late-bind in
//! `start`.
//!
//! ## Basic module example
//!
//! ```rust,ignore
//! use flowkit::{Module, ModuleCtx};
//!
//! struct EchoHandler { name: String }
//!
//! #[flowkit::async_trait]
//! impl Module for EchoHandler {
//!     fn name(&self) -> &str { &self.name }
//!     async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
//!         ctx.registry().register(self.name.clone(), my_callable)?;
//!         Ok(())
//!     }
//!     fn as_any(&self) -> &dyn std::any::Any { self }
//! }
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

pub mod config;
pub mod contracts;
pub mod engine;
pub mod error;
pub mod events;
pub mod factory;
pub mod graph;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod template;

pub use config::{ModuleConfig, SecretsSource, WorkflowConfig};
pub use contracts::{
    CallContract, Callable, EngineCtx, JsonMap, Module, ModuleCtx, StatefulModule, Trigger,
    TriggerCtx, WireableModule, WorkflowDispatcher, WorkflowHandler,
};
pub use engine::{Engine, EngineOptions};
pub use error::{ConfigError, EngineError, ErrorBody, ErrorKind, WorkflowError};
pub use events::{Event, EventBus, EventStream};
pub use factory::{ModuleFactory, TriggerFactory};
pub use health::{HealthCheck, HealthRegistry, HealthReport, HealthStatus};
pub use metrics::WorkflowMetrics;
pub use registry::{RegistryError, ServiceRegistry};

/// Well-known service names used by the post-init wiring protocol.
pub mod wellknown {
    /// Shared prometheus registry published by the engine.
    pub const METRICS_REGISTRY: &str = "metrics.registry";
    /// Shared health-check registry published by the engine.
    pub const HEALTH_REGISTRY: &str = "health.registry";
}
