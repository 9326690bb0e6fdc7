use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flowkit::{Callable, JsonMap, Module, ModuleCtx, ServiceRegistry, WireableModule};

use crate::engine::StateMachineEngine;

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    100
}
fn default_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingStepConfig {
    /// Service name of the callable to invoke.
    #[serde(rename = "componentID", alias = "componentId")]
    pub component_id: String,
    /// Service name of the bound state machine engine.
    #[serde(rename = "stateMachine")]
    pub state_machine: String,
    #[serde(rename = "successTransition")]
    pub success_transition: String,
    #[serde(rename = "compensateTransition")]
    pub compensate_transition: String,
    #[serde(default = "default_max_retries", rename = "maxRetries")]
    pub max_retries: u32,
    /// Base backoff, doubled per attempt.
    #[serde(default = "default_backoff_ms", rename = "retryBackoffMs")]
    pub retry_backoff_ms: u64,
    /// Per-attempt timeout.
    #[serde(default = "default_timeout_seconds", rename = "timeoutSeconds")]
    pub timeout_seconds: u64,
}

struct Bound {
    cfg: ProcessingStepConfig,
    component: Arc<dyn Callable>,
    machine: Arc<StateMachineEngine>,
}

/// Shared step state: configuration plus lazily-bound component and
/// engine; also the callable surface published in the registry.
struct StepState {
    name: String,
    cfg: ArcSwapOption<ProcessingStepConfig>,
    registry: ArcSwapOption<ServiceRegistry>,
    bound: ArcSwapOption<Bound>,
    cancel: ArcSwapOption<CancellationToken>,
}

impl StepState {
    /// Resolve the component and engine from the registry. Called eagerly
    /// at init and again lazily — the component may be published by a
    /// module that inits later.
    fn try_bind(&self) -> anyhow::Result<Arc<Bound>> {
        if let Some(bound) = self.bound.load_full() {
            return Ok(bound);
        }
        let cfg = self
            .cfg
            .load_full()
            .ok_or_else(|| anyhow::anyhow!("processing step '{}' not initialized", self.name))?;
        let registry = self
            .registry
            .load_full()
            .ok_or_else(|| anyhow::anyhow!("processing step '{}' not initialized", self.name))?;

        let component: Arc<dyn Callable> = registry.get(&cfg.component_id)?;
        let machine: Arc<StateMachineEngine> = registry.get(&cfg.state_machine)?;
        let bound = Arc::new(Bound {
            cfg: (*cfg).clone(),
            component,
            machine,
        });
        self.bound.store(Some(bound.clone()));
        Ok(bound)
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancel
            .load_full()
            .map(|t| (*t).clone())
            .unwrap_or_default()
    }

    /// Invoke the component for an instance: retry transient failures with
    /// exponential backoff, then fire the success or compensate transition.
    /// At most one transition fires per run; retries fire none.
    async fn run(&self, instance_id: &str, params: JsonMap) -> anyhow::Result<JsonMap> {
        let bound = self.try_bind()?;
        let cfg = &bound.cfg;
        let cancel = self.cancellation();

        let mut attempt: u32 = 1;
        loop {
            debug!(step = %self.name, instance = instance_id, attempt, "Invoking component");

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    anyhow::bail!("processing step '{}' cancelled", self.name);
                }
                result = tokio::time::timeout(
                    Duration::from_secs(cfg.timeout_seconds),
                    bound.component.execute(params.clone()),
                ) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(anyhow::anyhow!(
                        "attempt timed out after {}s",
                        cfg.timeout_seconds
                    )),
                },
            };

            match outcome {
                Ok(output) => {
                    bound
                        .machine
                        .trigger(instance_id, &cfg.success_transition, output.clone())
                        .await?;
                    return Ok(output);
                }
                Err(e) => {
                    if attempt <= cfg.max_retries {
                        let backoff = Duration::from_millis(
                            cfg.retry_backoff_ms
                                .saturating_mul(1u64 << (attempt - 1).min(32)),
                        );
                        warn!(
                            step = %self.name,
                            instance = instance_id,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Component failed; retrying"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                anyhow::bail!("processing step '{}' cancelled during backoff", self.name);
                            }
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        attempt += 1;
                        continue;
                    }

                    warn!(
                        step = %self.name,
                        instance = instance_id,
                        attempts = attempt,
                        error = %e,
                        "Attempts exhausted; firing compensate transition"
                    );
                    let mut compensate_payload = JsonMap::new();
                    compensate_payload
                        .insert("error".to_string(), serde_json::json!(e.to_string()));
                    compensate_payload
                        .insert("attempts".to_string(), serde_json::json!(attempt));
                    bound
                        .machine
                        .trigger(instance_id, &cfg.compensate_transition, compensate_payload)
                        .await?;
                    return Err(e);
                }
            }
        }
    }
}

/// Processing steps are callable, so pipelines and hooks can invoke them.
/// The instance id travels in `instance_id` (or `id`).
#[async_trait]
impl Callable for StepState {
    async fn execute(&self, mut params: JsonMap) -> anyhow::Result<JsonMap> {
        let instance_id = params
            .remove("instance_id")
            .or_else(|| params.remove("id"))
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| anyhow::anyhow!("missing 'instance_id' parameter"))?;
        self.run(&instance_id, params).await
    }

    fn contract(&self) -> flowkit::CallContract {
        flowkit::CallContract {
            required: vec!["instance_id".to_string()],
            optional: vec![],
            outputs: vec![],
        }
    }
}

/// The `processing.step` module: invokes a callable component with
/// retry/backoff and bridges its outcome to exactly one state machine
/// transition per run. The decision is error-based — a callable signalling
/// business failure must return an error.
pub struct ProcessingStep {
    state: Arc<StepState>,
}

impl ProcessingStep {
    pub fn new(name: &str) -> Self {
        Self {
            state: Arc::new(StepState {
                name: name.to_string(),
                cfg: ArcSwapOption::from(None),
                registry: ArcSwapOption::from(None),
                bound: ArcSwapOption::from(None),
                cancel: ArcSwapOption::from(None),
            }),
        }
    }

    pub async fn run(&self, instance_id: &str, params: JsonMap) -> anyhow::Result<JsonMap> {
        self.state.run(instance_id, params).await
    }
}

#[async_trait]
impl Module for ProcessingStep {
    fn name(&self) -> &str {
        &self.state.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg: ProcessingStepConfig = ctx.config()?;
        self.state.cfg.store(Some(Arc::new(cfg)));
        self.state.registry.store(Some(ctx.registry().clone()));
        self.state.cancel.store(Some(Arc::new(ctx.cancellation())));

        // Published as a callable so hooks and pipeline steps can invoke
        // this step by name.
        ctx.registry().register(
            self.state.name.clone(),
            self.state.clone() as Arc<dyn Callable>,
        )?;

        // Eager resolution per the contract; components published by
        // later-initializing modules bind in the wiring pass instead.
        if let Err(e) = self.state.try_bind() {
            debug!(step = %self.state.name, error = %e, "Component not yet resolvable; deferring to wiring");
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_wireable(&self) -> Option<&dyn WireableModule> {
        Some(self)
    }
}

impl WireableModule for ProcessingStep {
    fn wire(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        self.state.try_bind().map(|_| ())
    }
}
