use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowkit::{Callable, JsonMap, Module, ModuleCtx, ServiceRegistry, StatefulModule};

/// When a job fires: a fixed interval or a cron expression
/// (six-field, with seconds).
#[derive(Debug, Clone)]
pub enum Schedule {
    Every(Duration),
    Cron(cron::Schedule),
}

impl Schedule {
    /// Time until the next firing.
    pub fn next_delay(&self) -> Option<Duration> {
        match self {
            Schedule::Every(interval) => Some(*interval),
            Schedule::Cron(schedule) => {
                let next = schedule.upcoming(Utc).next()?;
                (next - Utc::now()).to_std().ok()
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Service name of the callable to invoke on fire.
    pub component: String,
    #[serde(default, with = "humantime_serde::option")]
    pub interval: Option<Duration>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub params: JsonMap,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchedulerConfig {
    #[serde(default)]
    jobs: Vec<JobConfig>,
}

/// A validated job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub component: String,
    pub schedule: Schedule,
    pub params: JsonMap,
}

impl JobSpec {
    fn from_config(cfg: JobConfig) -> anyhow::Result<Self> {
        let schedule = match (&cfg.interval, &cfg.cron) {
            (Some(interval), None) => Schedule::Every(*interval),
            (None, Some(expr)) => Schedule::Cron(
                cron::Schedule::from_str(expr)
                    .map_err(|e| anyhow::anyhow!("invalid cron expression '{expr}': {e}"))?,
            ),
            (Some(_), Some(_)) => {
                anyhow::bail!("job '{:?}' sets both 'interval' and 'cron'", cfg.name)
            }
            (None, None) => {
                anyhow::bail!("job '{:?}' needs 'interval' or 'cron'", cfg.name)
            }
        };
        Ok(Self {
            name: cfg
                .name
                .unwrap_or_else(|| format!("job:{}", cfg.component)),
            component: cfg.component,
            schedule,
            params: cfg.params,
        })
    }
}

/// The scheduler core: runs each registered job on its own task, invoking
/// the named callable on fire. Jobs resolve their components at fire time
/// (late binding). Published in the registry so the `schedule` workflow
/// handler can add jobs to it.
pub struct ModularScheduler {
    name: String,
    jobs: Mutex<Vec<JobSpec>>,
    registry: Mutex<Option<Arc<ServiceRegistry>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ModularScheduler {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            jobs: Mutex::new(Vec::new()),
            registry: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a job; used by the `schedule` workflow handler and the
    /// module's own config.
    pub fn add_job(&self, job: JobSpec) {
        debug!(scheduler = %self.name, job = %job.name, "Job registered");
        self.jobs.lock().push(job);
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    fn bind_registry(&self, registry: Arc<ServiceRegistry>) {
        *self.registry.lock() = Some(registry);
    }

    /// Spawn one task per registered job.
    pub async fn start_jobs(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let registry = self
            .registry
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("scheduler '{}' not initialized", self.name))?;

        let jobs = self.jobs.lock().clone();
        let mut handles = self.handles.lock();
        for job in jobs {
            handles.push(tokio::spawn(Self::run_job(
                job,
                registry.clone(),
                cancel.clone(),
            )));
        }
        Ok(())
    }

    pub async fn stop_jobs(&self) -> anyhow::Result<()> {
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        Ok(())
    }

    async fn run_job(job: JobSpec, registry: Arc<ServiceRegistry>, cancel: CancellationToken) {
        loop {
            let Some(delay) = job.schedule.next_delay() else {
                warn!(job = %job.name, "Schedule has no upcoming firing; job exits");
                return;
            };

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let callable: Arc<dyn Callable> = match registry.get(&job.component) {
                Ok(c) => c,
                Err(e) => {
                    warn!(job = %job.name, error = %e, "Job component not resolvable; skipping tick");
                    continue;
                }
            };

            let mut params = job.params.clone();
            params.insert(
                "scheduled_at".to_string(),
                serde_json::json!(Utc::now().to_rfc3339()),
            );

            debug!(job = %job.name, "Job firing");
            if let Err(e) = callable.execute(params).await {
                warn!(job = %job.name, error = %e, "Scheduled job failed");
            }
        }
    }
}

/// The `scheduler.modular` module: publishes a [`ModularScheduler`] under
/// the module name and drives its job tasks between start and stop.
pub struct SchedulerModule {
    name: String,
    inner: Arc<ModularScheduler>,
}

impl SchedulerModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Arc::new(ModularScheduler::new(name)),
        }
    }

    pub fn inner(&self) -> Arc<ModularScheduler> {
        self.inner.clone()
    }
}

#[async_trait]
impl Module for SchedulerModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg: SchedulerConfig = ctx.config()?;
        for job in cfg.jobs {
            self.inner.add_job(JobSpec::from_config(job)?);
        }
        self.inner.bind_registry(ctx.registry().clone());
        ctx.registry().register(self.name.clone(), self.inner.clone())?;
        info!(scheduler = %self.name, jobs = self.inner.job_count(), "Scheduler initialized");
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_stateful(&self) -> Option<&dyn StatefulModule> {
        Some(self)
    }
}

#[async_trait]
impl StatefulModule for SchedulerModule {
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.inner.start_jobs(cancel).await
    }

    async fn stop(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        self.inner.stop_jobs().await
    }
}
