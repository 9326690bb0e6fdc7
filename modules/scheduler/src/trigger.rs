use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flowkit::{JsonMap, Trigger, TriggerCtx, WorkflowDispatcher};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleTriggerConfig {
    /// Six-field cron expression (with seconds).
    pub cron: String,
    #[serde(rename = "workflowType")]
    pub workflow_type: String,
    pub action: String,
}

/// Fires a workflow on a cron schedule with `{scheduled_at}` as data.
pub struct ScheduleTrigger {
    name: String,
    schedule: cron::Schedule,
    workflow_type: String,
    action: String,
    dispatcher: Arc<dyn WorkflowDispatcher>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleTrigger {
    pub fn from_config(
        cfg: &serde_json::Value,
        ctx: &TriggerCtx,
    ) -> anyhow::Result<Arc<dyn Trigger>> {
        let cfg: ScheduleTriggerConfig = serde_json::from_value(cfg.clone())?;
        let schedule = cron::Schedule::from_str(&cfg.cron)
            .map_err(|e| anyhow::anyhow!("invalid cron expression '{}': {e}", cfg.cron))?;

        let name = format!("schedule:{}", cfg.cron);
        info!(trigger = %name, workflow = %cfg.workflow_type, action = %cfg.action, "Schedule trigger configured");
        Ok(Arc::new(ScheduleTrigger {
            name,
            schedule,
            workflow_type: cfg.workflow_type,
            action: cfg.action,
            dispatcher: ctx.dispatcher(),
            handle: Mutex::new(None),
        }))
    }
}

#[async_trait]
impl Trigger for ScheduleTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let schedule = self.schedule.clone();
        let dispatcher = self.dispatcher.clone();
        let workflow_type = self.workflow_type.clone();
        let action = self.action.clone();
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!(trigger = %name, "No upcoming firing; trigger exits");
                    return;
                };
                let Ok(delay) = (next - Utc::now()).to_std() else {
                    // The firing instant passed while computing; try again.
                    continue;
                };

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let mut data = JsonMap::new();
                data.insert(
                    "scheduled_at".to_string(),
                    serde_json::json!(Utc::now().to_rfc3339()),
                );
                if let Err(e) = dispatcher
                    .trigger_workflow(&workflow_type, &action, data)
                    .await
                {
                    warn!(trigger = %name, error = %e, "Scheduled workflow failed");
                }
            }
        });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkit::{EngineCtx, EventBus, ServiceRegistry};
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    struct Recording(Arc<StdMutex<Vec<JsonMap>>>);

    #[async_trait]
    impl WorkflowDispatcher for Recording {
        async fn trigger_workflow(
            &self,
            _kind: &str,
            _action: &str,
            data: JsonMap,
        ) -> anyhow::Result<JsonMap> {
            self.0.lock().unwrap().push(data);
            Ok(JsonMap::new())
        }
    }

    fn trigger_ctx(fired: Arc<StdMutex<Vec<JsonMap>>>) -> TriggerCtx {
        TriggerCtx::new(
            Arc::new(Recording(fired)),
            EngineCtx::new(
                Arc::new(ServiceRegistry::new()),
                EventBus::new(),
                CancellationToken::new(),
                PathBuf::from("."),
            ),
        )
    }

    #[tokio::test]
    async fn rejects_invalid_cron() {
        let fired = Arc::new(StdMutex::new(Vec::new()));
        let result = ScheduleTrigger::from_config(
            &serde_json::json!({
                "cron": "whenever",
                "workflowType": "statemachine",
                "action": "tick"
            }),
            &trigger_ctx(fired),
        );
        let Err(err) = result else {
            panic!("expected an error");
        };
        assert!(err.to_string().contains("invalid cron"));
    }

    #[tokio::test]
    async fn fires_with_scheduled_at_payload() {
        let fired = Arc::new(StdMutex::new(Vec::new()));
        // Every second.
        let trigger = ScheduleTrigger::from_config(
            &serde_json::json!({
                "cron": "* * * * * *",
                "workflowType": "statemachine",
                "action": "tick"
            }),
            &trigger_ctx(fired.clone()),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        trigger.start(cancel.clone()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        cancel.cancel();
        trigger.stop().await.unwrap();

        let calls = fired.lock().unwrap();
        assert!(!calls.is_empty());
        assert!(calls[0].contains_key("scheduled_at"));
    }
}
