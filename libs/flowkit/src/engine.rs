//! Engine - turns a parsed workflow configuration into a running system.
//!
//! Build phases: validate → instantiate → init → wire → workflows →
//! triggers → pipelines. Runtime: start (modules, then triggers; partial
//! rollback on failure), stop (reverse order, collecting the last error),
//! and `trigger_workflow` dispatch with events and metrics.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::WorkflowConfig;
use crate::contracts::{
    EngineCtx, JsonMap, Module, ModuleCtx, Trigger, TriggerCtx, WorkflowDispatcher,
    WorkflowHandler,
};
use crate::error::{ConfigError, EngineError};
use crate::events::EventBus;
use crate::factory::{ModuleFactory, TriggerFactory};
use crate::graph;
use crate::health::HealthRegistry;
use crate::metrics::WorkflowMetrics;
use crate::registry::ServiceRegistry;
use crate::wellknown;

/// Everything the engine needs besides the configuration document: the
/// module factory, trigger builders and workflow handlers registered by
/// the application.
pub struct EngineOptions {
    pub factory: ModuleFactory,
    pub triggers: TriggerFactory,
    pub handlers: Vec<Arc<dyn WorkflowHandler>>,
    /// Directory of the configuration file; anchors relative paths.
    pub base_dir: PathBuf,
    pub cancel: CancellationToken,
}

struct ModuleEntry {
    name: String,
    module: Arc<dyn Module>,
    ctx: ModuleCtx,
}

struct RunState {
    token: CancellationToken,
}

pub(crate) struct EngineInner {
    registry: Arc<ServiceRegistry>,
    events: EventBus,
    metrics: Arc<WorkflowMetrics>,
    health: HealthRegistry,
    modules: Vec<ModuleEntry>, // init order
    handlers: Vec<Arc<dyn WorkflowHandler>>,
    triggers: Mutex<Vec<Arc<dyn Trigger>>>,
    cancel: CancellationToken,
    run: Mutex<Option<RunState>>,
}

/// The engine orchestrator. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Build a runnable system from a parsed configuration document.
    pub async fn build_from_config(
        cfg: WorkflowConfig,
        opts: EngineOptions,
    ) -> Result<Engine, EngineError> {
        let registry = Arc::new(ServiceRegistry::new());
        let events = EventBus::new();
        let metrics = Arc::new(WorkflowMetrics::new());
        let health = HealthRegistry::new();

        // Shared observability services: published before any module init
        // so every module can contribute.
        registry
            .register(wellknown::METRICS_REGISTRY, metrics.clone())
            .map_err(|e| EngineError::Init {
                module: "engine".to_string(),
                source: e.into(),
            })?;
        registry
            .register(wellknown::HEALTH_REGISTRY, health.clone())
            .map_err(|e| EngineError::Init {
                module: "engine".to_string(),
                source: e.into(),
            })?;

        // Phase: validate
        tracing::info!("Phase: validate");
        let order = graph::init_order(&cfg.modules)?;
        for m in &cfg.modules {
            if !opts.factory.contains(&m.type_tag) {
                return Err(EngineError::UnknownType {
                    module: m.name.clone(),
                    type_tag: m.type_tag.clone(),
                });
            }
        }
        for kind in cfg.workflows.keys() {
            if !opts.handlers.iter().any(|h| h.can_handle(kind)) {
                return Err(EngineError::UnclaimedWorkflow(kind.clone()));
            }
        }
        if !cfg.pipelines.is_empty()
            && !opts.handlers.iter().any(|h| h.can_handle("pipeline"))
        {
            return Err(EngineError::UnclaimedWorkflow("pipeline".to_string()));
        }
        for kind in cfg.triggers.keys() {
            if !opts.triggers.contains(kind) {
                return Err(EngineError::UnknownTriggerKind(kind.clone()));
            }
        }

        // Phase: instantiate (declared order)
        tracing::info!("Phase: instantiate");
        let engine_ctx = EngineCtx::new(
            registry.clone(),
            events.clone(),
            opts.cancel.clone(),
            opts.base_dir.clone(),
        );
        let mut entries: Vec<Option<ModuleEntry>> = Vec::with_capacity(cfg.modules.len());
        for m in &cfg.modules {
            let module = opts.factory.build(m)?;
            let ctx = ModuleCtx::new(
                m.name.as_str(),
                m.config.clone(),
                m.depends_on.clone(),
                m.branches.clone(),
                engine_ctx.clone(),
            );
            entries.push(Some(ModuleEntry {
                name: m.name.clone(),
                module,
                ctx,
            }));
        }

        let mut modules = Vec::with_capacity(entries.len());
        for i in order {
            if let Some(entry) = entries[i].take() {
                modules.push(entry);
            }
        }

        // Phase: init (topological order, alphabetical tie-break)
        tracing::info!("Phase: init");
        for entry in &modules {
            tracing::debug!(module = %entry.name, "Initializing module");
            entry
                .module
                .init(&entry.ctx)
                .await
                .map_err(|source| EngineError::Init {
                    module: entry.name.clone(),
                    source,
                })?;
        }

        // Phase: wire (post-init) — the registry is complete, no module has
        // started. Consumers capture their references here; optional
        // consumers may still late-bind in start.
        tracing::info!("Phase: wire");
        for entry in &modules {
            if let Some(wireable) = entry.module.as_wireable() {
                tracing::debug!(module = %entry.name, "Wiring module");
                wireable
                    .wire(&entry.ctx)
                    .map_err(|source| EngineError::Wire {
                        module: entry.name.clone(),
                        source,
                    })?;
            }
        }

        // Phase: workflows — each section goes to the first handler that
        // claims its kind.
        tracing::info!("Phase: workflows");
        for (kind, section) in &cfg.workflows {
            let handler = opts
                .handlers
                .iter()
                .find(|h| h.can_handle(kind))
                .ok_or_else(|| EngineError::UnclaimedWorkflow(kind.clone()))?;
            handler
                .configure(section, &engine_ctx)
                .await
                .map_err(|source| EngineError::ConfigureWorkflow {
                    kind: kind.clone(),
                    source,
                })?;
        }

        let inner = Arc::new(EngineInner {
            registry,
            events,
            metrics,
            health,
            modules,
            handlers: opts.handlers,
            triggers: Mutex::new(Vec::new()),
            cancel: opts.cancel,
            run: Mutex::new(None),
        });

        let dispatcher: Arc<dyn WorkflowDispatcher> = Arc::new(Dispatcher {
            inner: Arc::downgrade(&inner),
        });
        let trigger_ctx = TriggerCtx::new(dispatcher, engine_ctx.clone());

        // Phase: triggers
        tracing::info!("Phase: triggers");
        let mut triggers = Vec::new();
        for (kind, trigger_cfg) in &cfg.triggers {
            triggers.push(opts.triggers.build(kind, trigger_cfg, &trigger_ctx)?);
        }

        // Phase: pipelines — the map goes to the pipeline handler; inline
        // pipeline triggers become regular triggers firing
        // `pipeline:<name>`.
        if !cfg.pipelines.is_empty() {
            tracing::info!("Phase: pipelines");
            let section =
                serde_json::Value::Object(cfg.pipelines.clone().into_iter().collect());
            let handler = inner
                .handlers
                .iter()
                .find(|h| h.can_handle("pipeline"))
                .ok_or_else(|| EngineError::UnclaimedWorkflow("pipeline".to_string()))?;
            handler
                .configure(&section, &engine_ctx)
                .await
                .map_err(|source| EngineError::ConfigureWorkflow {
                    kind: "pipeline".to_string(),
                    source,
                })?;

            for (name, body) in &cfg.pipelines {
                let Some(trigger) = body.get("trigger") else {
                    continue;
                };
                let kind = trigger
                    .get("type")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        EngineError::Config(ConfigError::new(
                            format!("pipelines.{name}.trigger.type"),
                            "missing trigger type",
                        ))
                    })?;
                let mut trigger_cfg = trigger
                    .get("config")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({}));
                if let Some(map) = trigger_cfg.as_object_mut() {
                    map.insert(
                        "workflowType".to_string(),
                        serde_json::Value::String(format!("pipeline:{name}")),
                    );
                    map.entry("action".to_string())
                        .or_insert_with(|| serde_json::Value::String("run".to_string()));
                }
                triggers.push(opts.triggers.build(kind, &trigger_cfg, &trigger_ctx)?);
            }
        }

        *inner.triggers.lock() = triggers;

        Ok(Engine { inner })
    }

    /// Start all stateful modules (init order), then all triggers. A
    /// failure stops everything already started, in reverse, and returns
    /// the first error.
    pub async fn start(&self) -> Result<(), EngineError> {
        tracing::info!("Phase: start");
        let run = self.inner.cancel.child_token();

        let mut started_modules = 0usize;
        for entry in &self.inner.modules {
            if let Some(stateful) = entry.module.as_stateful() {
                tracing::debug!(module = %entry.name, "Starting module");
                if let Err(source) = stateful.start(run.clone()).await {
                    let err = EngineError::Start {
                        name: entry.name.clone(),
                        source,
                    };
                    self.rollback(&run, started_modules, 0).await;
                    return Err(err);
                }
            }
            started_modules += 1;
        }

        let triggers = self.inner.triggers.lock().clone();
        let mut started_triggers = 0usize;
        for trigger in &triggers {
            tracing::debug!(trigger = %trigger.name(), "Starting trigger");
            if let Err(source) = trigger.start(run.clone()).await {
                let err = EngineError::Start {
                    name: trigger.name().to_string(),
                    source,
                };
                self.rollback(&run, started_modules, started_triggers).await;
                return Err(err);
            }
            started_triggers += 1;
        }

        *self.inner.run.lock() = Some(RunState { token: run });
        Ok(())
    }

    async fn rollback(&self, run: &CancellationToken, modules: usize, triggers: usize) {
        tracing::warn!("Start failed; rolling back started components");
        run.cancel();

        let started: Vec<Arc<dyn Trigger>> = {
            let all = self.inner.triggers.lock();
            all.iter().take(triggers).cloned().collect()
        };
        for trigger in started.iter().rev() {
            if let Err(e) = trigger.stop().await {
                tracing::warn!(trigger = %trigger.name(), error = %e, "Failed to stop trigger during rollback");
            }
        }

        for entry in self.inner.modules[..modules].iter().rev() {
            if let Some(stateful) = entry.module.as_stateful() {
                if let Err(e) = stateful.stop(run.clone()).await {
                    tracing::warn!(module = %entry.name, error = %e, "Failed to stop module during rollback");
                }
            }
        }
    }

    /// Stop triggers and modules in reverse start order. Continues past
    /// failures and returns the last error seen.
    pub async fn stop(&self) -> Result<(), EngineError> {
        tracing::info!("Phase: stop");
        let token = match self.inner.run.lock().take() {
            Some(run) => run.token,
            None => self.inner.cancel.child_token(),
        };
        token.cancel();

        let mut last_err = None;

        let triggers = self.inner.triggers.lock().clone();
        for trigger in triggers.iter().rev() {
            if let Err(source) = trigger.stop().await {
                tracing::warn!(trigger = %trigger.name(), error = %source, "Failed to stop trigger");
                last_err = Some(EngineError::Stop {
                    name: trigger.name().to_string(),
                    source,
                });
            }
        }

        for entry in self.inner.modules.iter().rev() {
            if let Some(stateful) = entry.module.as_stateful() {
                if let Err(source) = stateful.stop(token.clone()).await {
                    tracing::warn!(module = %entry.name, error = %source, "Failed to stop module");
                    last_err = Some(EngineError::Stop {
                        name: entry.name.clone(),
                        source,
                    });
                }
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wait until the engine's cancellation token fires.
    pub async fn wait_for_shutdown(&self) {
        self.inner.cancel.cancelled().await;
    }

    pub async fn trigger_workflow(
        &self,
        kind: &str,
        action: &str,
        data: JsonMap,
    ) -> anyhow::Result<JsonMap> {
        self.inner.trigger_workflow(kind, action, data).await
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.inner.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn metrics(&self) -> &Arc<WorkflowMetrics> {
        &self.inner.metrics
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.inner.health
    }

    /// Resolved module names in init order (diagnostics).
    pub fn module_names(&self) -> Vec<String> {
        self.inner.modules.iter().map(|e| e.name.clone()).collect()
    }
}

#[async_trait]
impl WorkflowDispatcher for Engine {
    async fn trigger_workflow(
        &self,
        kind: &str,
        action: &str,
        data: JsonMap,
    ) -> anyhow::Result<JsonMap> {
        self.inner.trigger_workflow(kind, action, data).await
    }
}

impl EngineInner {
    async fn trigger_workflow(
        &self,
        kind: &str,
        action: &str,
        data: JsonMap,
    ) -> anyhow::Result<JsonMap> {
        let started = Instant::now();
        self.events.publish(
            "workflow.started",
            serde_json::json!({ "kind": kind, "action": action }),
        );

        let Some(handler) = self.handlers.iter().find(|h| h.can_handle(kind)) else {
            self.metrics
                .observe(kind, action, "unmatched", started.elapsed());
            self.events.publish(
                "workflow.failed",
                serde_json::json!({
                    "kind": kind,
                    "action": action,
                    "error": "no workflow handler claims this kind",
                }),
            );
            anyhow::bail!("no workflow handler claims kind '{kind}'");
        };

        match handler.execute(kind, action, data).await {
            Ok(result) => {
                let elapsed = started.elapsed();
                self.events.publish(
                    "workflow.completed",
                    serde_json::json!({
                        "kind": kind,
                        "action": action,
                        "duration_ms": elapsed.as_millis() as u64,
                    }),
                );
                self.metrics.observe(kind, action, "completed", elapsed);
                Ok(result)
            }
            Err(e) => {
                let elapsed = started.elapsed();
                tracing::warn!(kind, action, error = %e, "Workflow failed");
                self.events.publish(
                    "workflow.failed",
                    serde_json::json!({
                        "kind": kind,
                        "action": action,
                        "error": e.to_string(),
                        "duration_ms": elapsed.as_millis() as u64,
                    }),
                );
                self.metrics.observe(kind, action, "failed", elapsed);
                Err(e)
            }
        }
    }
}

/// Weak dispatch handle handed to triggers, breaking the
/// engine → trigger → engine reference cycle.
struct Dispatcher {
    inner: Weak<EngineInner>,
}

#[async_trait]
impl WorkflowDispatcher for Dispatcher {
    async fn trigger_workflow(
        &self,
        kind: &str,
        action: &str,
        data: JsonMap,
    ) -> anyhow::Result<JsonMap> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("engine is shut down"))?;
        inner.trigger_workflow(kind, action, data).await
    }
}
