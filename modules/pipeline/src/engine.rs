use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use flowkit::{ErrorKind, JsonMap, WorkflowError};

/// Jump bound per execution, breaking conditional loops in buggy
/// definitions.
const MAX_STEP_VISITS: usize = 1024;

/// What a step tells the pipeline to do next.
#[derive(Debug)]
pub enum StepOutcome {
    Continue,
    /// Labelled jump to a named step.
    Jump(String),
}

/// One unit of pipeline work. Steps mutate the shared context map.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &mut JsonMap) -> anyhow::Result<StepOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    #[default]
    Stop,
    Skip,
    Compensate,
}

/// A named, ordered sequence of steps with an error strategy, optional
/// overall timeout and optional compensation steps (entry `i` compensates
/// step `i`).
pub struct Pipeline {
    name: String,
    steps: Vec<Arc<dyn PipelineStep>>,
    on_error: ErrorStrategy,
    timeout: Option<Duration>,
    compensation: Vec<Arc<dyn PipelineStep>>,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        steps: Vec<Arc<dyn PipelineStep>>,
        on_error: ErrorStrategy,
        timeout: Option<Duration>,
        compensation: Vec<Arc<dyn PipelineStep>>,
    ) -> Self {
        Self {
            name: name.into(),
            steps,
            on_error,
            timeout,
            compensation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the pipeline over a fresh context seeded from the trigger
    /// payload.
    pub async fn execute(&self, initial: JsonMap) -> anyhow::Result<JsonMap> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.run_steps(initial))
                .await
                .map_err(|_| {
                    anyhow::Error::from(WorkflowError::new(
                        ErrorKind::Cancelled,
                        format!(
                            "pipeline '{}' exceeded its {}s timeout",
                            self.name,
                            timeout.as_secs()
                        ),
                    ))
                })?,
            None => self.run_steps(initial).await,
        }
    }

    async fn run_steps(&self, mut ctx: JsonMap) -> anyhow::Result<JsonMap> {
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name(), i))
            .collect();

        let mut executed: Vec<usize> = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        let mut visits = 0usize;
        let mut i = 0usize;

        while i < self.steps.len() {
            visits += 1;
            if visits > MAX_STEP_VISITS {
                anyhow::bail!(
                    "pipeline '{}' exceeded {MAX_STEP_VISITS} step visits (conditional loop?)",
                    self.name
                );
            }

            let step = &self.steps[i];
            debug!(pipeline = %self.name, step = %step.name(), "Executing step");
            match step.execute(&mut ctx).await {
                Ok(StepOutcome::Continue) => {
                    executed.push(i);
                    i += 1;
                }
                Ok(StepOutcome::Jump(label)) => {
                    executed.push(i);
                    let Some(&target) = index.get(label.as_str()) else {
                        anyhow::bail!(
                            "pipeline '{}': step '{}' jumps to unknown step '{label}'",
                            self.name,
                            step.name()
                        );
                    };
                    i = target;
                }
                Err(e) => match self.on_error {
                    ErrorStrategy::Stop => {
                        return Err(e.context(format!(
                            "pipeline '{}' stopped at step '{}'",
                            self.name,
                            step.name()
                        )));
                    }
                    ErrorStrategy::Skip => {
                        warn!(pipeline = %self.name, step = %step.name(), error = %e, "Step failed; skipping");
                        failed.push(step.name().to_string());
                        i += 1;
                    }
                    ErrorStrategy::Compensate => {
                        self.compensate(&executed, &mut ctx).await;
                        return Err(e.context(format!(
                            "pipeline '{}' compensated after step '{}' failed",
                            self.name,
                            step.name()
                        )));
                    }
                },
            }
        }

        if !failed.is_empty() {
            ctx.insert("_failed_steps".to_string(), serde_json::json!(failed));
        }
        Ok(ctx)
    }

    /// Run compensation entries for executed steps, in reverse execution
    /// order. Compensation failures are logged, never propagated.
    async fn compensate(&self, executed: &[usize], ctx: &mut JsonMap) {
        for &step_index in executed.iter().rev() {
            let Some(comp) = self.compensation.get(step_index) else {
                continue;
            };
            debug!(pipeline = %self.name, step = %comp.name(), "Running compensation");
            if let Err(e) = comp.execute(ctx).await {
                warn!(pipeline = %self.name, step = %comp.name(), error = %e, "Compensation step failed");
            }
        }
    }
}
