use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::expand_env_value;
use crate::error::ConfigError;
use crate::events::EventBus;
use crate::registry::ServiceRegistry;

/// String-keyed payload map exchanged between triggers, handlers,
/// callables and state machine transitions.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Shared engine context handed to workflow handlers and module contexts.
#[derive(Clone)]
pub struct EngineCtx {
    registry: Arc<ServiceRegistry>,
    events: EventBus,
    cancel: CancellationToken,
    base_dir: PathBuf,
}

impl EngineCtx {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        events: EventBus,
        cancel: CancellationToken,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            events,
            cancel,
            base_dir,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve a possibly-relative path against the configuration file's
    /// directory.
    pub fn resolve_path(&self, p: impl AsRef<Path>) -> PathBuf {
        let p = p.as_ref();
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }
}

/// Per-module view of the engine: scoped config, declared dependencies and
/// the shared registry/event-bus handles.
#[derive(Clone)]
pub struct ModuleCtx {
    name: Arc<str>,
    config: serde_json::Value,
    depends_on: Arc<[String]>,
    branches: Arc<BTreeMap<String, String>>,
    engine: EngineCtx,
}

impl ModuleCtx {
    pub fn new(
        name: impl Into<Arc<str>>,
        config: serde_json::Value,
        depends_on: Vec<String>,
        branches: BTreeMap<String, String>,
        engine: EngineCtx,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            depends_on: depends_on.into(),
            branches: Arc::new(branches),
            engine,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deserialize this module's config section, expanding `$VAR` /
    /// `${VAR}` references and normalizing YAML numerics first. A missing
    /// section parses as an empty mapping so configs with all-default
    /// fields stay optional.
    pub fn config<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConfigError> {
        let mut expanded = expand_env_value(&self.config, &self.name)?;
        if expanded.is_null() {
            expanded = serde_json::Value::Object(serde_json::Map::new());
        }
        serde_json::from_value(crate::config::normalize_numbers(&expanded))
            .map_err(|e| ConfigError::new(format!("modules.{}.config", self.name), e.to_string()))
    }

    pub fn raw_config(&self) -> &serde_json::Value {
        &self.config
    }

    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    /// Conditional routing table (label → module name), if declared.
    pub fn branches(&self) -> &BTreeMap<String, String> {
        &self.branches
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.engine.registry()
    }

    pub fn events(&self) -> &EventBus {
        self.engine.events()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.engine.cancellation()
    }

    pub fn resolve_path(&self, p: impl AsRef<Path>) -> PathBuf {
        self.engine.resolve_path(p)
    }

    pub fn engine_ctx(&self) -> &EngineCtx {
        &self.engine
    }
}

/// Core module contract: configured instantiation, one-shot init.
///
/// An initialized module publishes zero or more named services to the
/// registry. Modules must not look up services belonging to other modules
/// during `init` unless those are declared in `dependsOn`; optional
/// consumers resolve in [`WireableModule::wire`] or late-bind in `start`.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Unique module name from the configuration document.
    fn name(&self) -> &str;

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;

    /// Return self as a StatefulModule if this module runs background work.
    fn as_stateful(&self) -> Option<&dyn StatefulModule> {
        None
    }

    /// Return self as a WireableModule to participate in post-init wiring.
    fn as_wireable(&self) -> Option<&dyn WireableModule> {
        None
    }
}

/// Background lifecycle: started after wiring, stopped in reverse order.
#[async_trait]
pub trait StatefulModule: Send + Sync {
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()>;
    async fn stop(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Post-init wiring: runs after every module's `init` completed and before
/// any `start`, so the registry is complete. Deterministic order (same as
/// init order).
pub trait WireableModule: Send + Sync {
    fn wire(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;
}

/// Declared inputs/outputs of a callable component.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CallContract {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// A unit of invokable work published in the registry.
///
/// Success and failure are expressed through the `Result` alone: a callable
/// that wants to signal business failure must return an error. Cancellation
/// propagates by dropping the future (timeouts wrap the call site).
#[async_trait]
pub trait Callable: Send + Sync {
    async fn execute(&self, params: JsonMap) -> anyhow::Result<JsonMap>;

    fn contract(&self) -> CallContract {
        CallContract::default()
    }
}

/// Dispatch surface triggers use to fire workflows on the engine.
#[async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    async fn trigger_workflow(
        &self,
        kind: &str,
        action: &str,
        data: JsonMap,
    ) -> anyhow::Result<JsonMap>;
}

/// Per-kind workflow configurator and executor.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    fn can_handle(&self, kind: &str) -> bool;

    /// Read the workflow section and wire modules via the registry.
    async fn configure(&self, section: &serde_json::Value, ctx: &EngineCtx) -> anyhow::Result<()>;

    /// Perform the kind's semantics for a triggered workflow.
    async fn execute(&self, kind: &str, action: &str, data: JsonMap) -> anyhow::Result<JsonMap>;
}

/// Context handed to trigger builders.
#[derive(Clone)]
pub struct TriggerCtx {
    dispatcher: Arc<dyn WorkflowDispatcher>,
    engine: EngineCtx,
}

impl TriggerCtx {
    pub fn new(dispatcher: Arc<dyn WorkflowDispatcher>, engine: EngineCtx) -> Self {
        Self { dispatcher, engine }
    }

    pub fn dispatcher(&self) -> Arc<dyn WorkflowDispatcher> {
        self.dispatcher.clone()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.engine.registry()
    }

    pub fn events(&self) -> &EventBus {
        self.engine.events()
    }

    pub fn engine_ctx(&self) -> &EngineCtx {
        &self.engine
    }
}

/// An external edge that fires workflows. Configuration is validated by the
/// trigger builder; `start` spawns the trigger loop and returns.
#[async_trait]
pub trait Trigger: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()>;

    /// Stop the trigger loop. Must tolerate never having been started.
    async fn stop(&self) -> anyhow::Result<()>;
}
