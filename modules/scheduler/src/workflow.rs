use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use flowkit::{EngineCtx, ErrorKind, JsonMap, WorkflowError, WorkflowHandler};

use crate::module::{JobSpec, ModularScheduler, Schedule};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Section {
    #[serde(default)]
    scheduler: Option<String>,
    #[serde(default)]
    jobs: Vec<JobEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobEntry {
    #[serde(default)]
    name: Option<String>,
    component: String,
    #[serde(default, with = "humantime_serde::option")]
    interval: Option<std::time::Duration>,
    #[serde(default)]
    cron: Option<String>,
    #[serde(default)]
    params: JsonMap,
}

/// Workflow handler for the `schedule` kind: registers `jobs[]` with the
/// named scheduler module.
#[derive(Default)]
pub struct SchedulerWorkflowHandler;

impl SchedulerWorkflowHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorkflowHandler for SchedulerWorkflowHandler {
    fn can_handle(&self, kind: &str) -> bool {
        kind == "schedule"
    }

    async fn configure(&self, section: &serde_json::Value, ctx: &EngineCtx) -> anyhow::Result<()> {
        let section: Section = serde_json::from_value(section.clone())?;

        let scheduler: Arc<ModularScheduler> = match &section.scheduler {
            Some(name) => ctx.registry().get(name)?,
            None => {
                let mut schedulers = ctx.registry().all_of::<Arc<ModularScheduler>>();
                match schedulers.len() {
                    0 => anyhow::bail!(
                        "schedule workflow requires a 'scheduler.modular' module"
                    ),
                    1 => schedulers.remove(0).1,
                    n => anyhow::bail!("{n} schedulers published; set 'scheduler' to pick one"),
                }
            }
        };

        for job in section.jobs {
            let schedule = match (&job.interval, &job.cron) {
                (Some(interval), None) => Schedule::Every(*interval),
                (None, Some(expr)) => Schedule::Cron(
                    expr.parse()
                        .map_err(|e| anyhow::anyhow!("invalid cron expression '{expr}': {e}"))?,
                ),
                _ => anyhow::bail!("job '{:?}' needs exactly one of 'interval' or 'cron'", job.name),
            };
            let name = job
                .name
                .unwrap_or_else(|| format!("job:{}", job.component));
            info!(job = %name, component = %job.component, "Scheduled job configured");
            scheduler.add_job(JobSpec {
                name,
                component: job.component,
                schedule,
                params: job.params,
            });
        }
        Ok(())
    }

    async fn execute(&self, _kind: &str, action: &str, _data: JsonMap) -> anyhow::Result<JsonMap> {
        Err(WorkflowError::new(
            ErrorKind::Permanent,
            format!("scheduled jobs fire from the scheduler; action '{action}' is not invokable"),
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkit::{EventBus, ServiceRegistry};
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn registers_jobs_on_named_scheduler() {
        let registry = Arc::new(ServiceRegistry::new());
        let scheduler = Arc::new(ModularScheduler::new("sched"));
        registry.register("sched", scheduler.clone()).unwrap();

        let handler = SchedulerWorkflowHandler::new();
        handler
            .configure(
                &serde_json::json!({
                    "scheduler": "sched",
                    "jobs": [
                        { "component": "cleanup", "interval": "30s" }
                    ]
                }),
                &EngineCtx::new(
                    registry,
                    EventBus::new(),
                    CancellationToken::new(),
                    PathBuf::from("."),
                ),
            )
            .await
            .unwrap();

        assert_eq!(scheduler.job_count(), 1);
    }
}
