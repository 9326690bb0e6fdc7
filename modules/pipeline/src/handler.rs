use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use flowkit::{EngineCtx, ErrorKind, JsonMap, WorkflowError, WorkflowHandler};

use crate::engine::{ErrorStrategy, Pipeline};
use crate::steps::{StepConfig, StepRegistry};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineBody {
    #[serde(default)]
    steps: Vec<StepConfig>,
    #[serde(default, rename = "onError")]
    on_error: ErrorStrategy,
    #[serde(default, with = "humantime_serde::option")]
    timeout: Option<Duration>,
    #[serde(default)]
    compensation: Vec<StepConfig>,
    /// Consumed by the engine (inline trigger); ignored here.
    #[serde(default)]
    #[allow(dead_code)]
    trigger: Option<serde_json::Value>,
}

/// Workflow handler for the `pipeline` kind. The engine hands over the
/// whole `pipelines` mapping at configure time; execution accepts both
/// `pipeline:<name>` kinds and the plain `pipeline` kind with the name as
/// action.
pub struct PipelineWorkflowHandler {
    steps: StepRegistry,
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
}

impl PipelineWorkflowHandler {
    pub fn new() -> Self {
        Self {
            steps: StepRegistry::with_builtins(),
            pipelines: RwLock::new(HashMap::new()),
        }
    }

    /// Register a pre-built pipeline.
    pub fn add_pipeline(&self, pipeline: Arc<Pipeline>) {
        self.pipelines
            .write()
            .insert(pipeline.name().to_string(), pipeline);
    }

    pub fn pipeline(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.read().get(name).cloned()
    }

    fn build_pipeline(
        &self,
        name: &str,
        body: PipelineBody,
        ctx: &EngineCtx,
    ) -> anyhow::Result<Pipeline> {
        let mut steps = Vec::with_capacity(body.steps.len());
        for step_cfg in &body.steps {
            steps.push(self.steps.build(step_cfg, ctx)?);
        }
        let mut compensation = Vec::with_capacity(body.compensation.len());
        for step_cfg in &body.compensation {
            compensation.push(self.steps.build(step_cfg, ctx)?);
        }
        Ok(Pipeline::new(
            name,
            steps,
            body.on_error,
            body.timeout,
            compensation,
        ))
    }
}

impl Default for PipelineWorkflowHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowHandler for PipelineWorkflowHandler {
    fn can_handle(&self, kind: &str) -> bool {
        kind == "pipeline" || kind.starts_with("pipeline:")
    }

    async fn configure(&self, section: &serde_json::Value, ctx: &EngineCtx) -> anyhow::Result<()> {
        let bodies: HashMap<String, PipelineBody> = serde_json::from_value(section.clone())?;
        for (name, body) in bodies {
            let pipeline = self
                .build_pipeline(&name, body, ctx)
                .map_err(|e| e.context(format!("pipeline '{name}'")))?;
            info!(pipeline = %name, "Pipeline registered");
            self.add_pipeline(Arc::new(pipeline));
        }
        Ok(())
    }

    async fn execute(&self, kind: &str, action: &str, data: JsonMap) -> anyhow::Result<JsonMap> {
        let name = kind.strip_prefix("pipeline:").unwrap_or(action);
        let pipeline = self.pipeline(name).ok_or_else(|| {
            WorkflowError::new(ErrorKind::NotFound, format!("pipeline '{name}' not found"))
        })?;
        pipeline.execute(data).await
    }
}
