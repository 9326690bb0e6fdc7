use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flowkit::{JsonMap, Trigger, TriggerCtx, WorkflowDispatcher};

use crate::broker::{MessageBroker, MessageHandler};

fn into_data(payload: serde_json::Value) -> JsonMap {
    match payload {
        serde_json::Value::Object(map) => map,
        other => {
            let mut map = JsonMap::new();
            map.insert("payload".to_string(), other);
            map
        }
    }
}

// ---------------- broker-topic trigger ----------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventTriggerConfig {
    pub topic: String,
    #[serde(rename = "workflowType")]
    pub workflow_type: String,
    pub action: String,
    #[serde(default)]
    pub broker: Option<String>,
}

struct FiringHandler {
    dispatcher: Arc<dyn WorkflowDispatcher>,
    workflow_type: String,
    action: String,
}

#[async_trait]
impl MessageHandler for FiringHandler {
    async fn handle(&self, topic: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        let mut data = into_data(payload);
        data.insert("topic".to_string(), serde_json::json!(topic));
        self.dispatcher
            .trigger_workflow(&self.workflow_type, &self.action, data)
            .await
            .map(|_| ())
    }
}

/// Fires a workflow for every message on a broker topic.
pub struct EventTrigger {
    name: String,
}

impl EventTrigger {
    pub fn from_config(
        cfg: &serde_json::Value,
        ctx: &TriggerCtx,
    ) -> anyhow::Result<Arc<dyn Trigger>> {
        let cfg: EventTriggerConfig = serde_json::from_value(cfg.clone())?;

        let broker: Arc<dyn MessageBroker> = match &cfg.broker {
            Some(name) => ctx.registry().get(name)?,
            None => {
                let mut brokers = ctx.registry().all_of::<Arc<dyn MessageBroker>>();
                if brokers.is_empty() {
                    anyhow::bail!("event trigger requires a 'messaging.broker' module");
                }
                brokers.remove(0).1
            }
        };

        broker.subscribe(
            &cfg.topic,
            Arc::new(FiringHandler {
                dispatcher: ctx.dispatcher(),
                workflow_type: cfg.workflow_type.clone(),
                action: cfg.action.clone(),
            }),
        );

        let name = format!("event:{}", cfg.topic);
        info!(trigger = %name, workflow = %cfg.workflow_type, "Event trigger configured");
        Ok(Arc::new(EventTrigger { name }))
    }
}

#[async_trait]
impl Trigger for EventTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------- in-process event bus trigger ----------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventBusTriggerConfig {
    /// Exact topic or trailing-`*` pattern.
    pub pattern: String,
    #[serde(rename = "workflowType")]
    pub workflow_type: String,
    pub action: String,
}

/// Fires a workflow for every engine event matching a pattern.
pub struct EventBusTrigger {
    name: String,
    cfg: EventBusTriggerConfig,
    dispatcher: Arc<dyn WorkflowDispatcher>,
    events: flowkit::EventBus,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventBusTrigger {
    pub fn from_config(
        cfg: &serde_json::Value,
        ctx: &TriggerCtx,
    ) -> anyhow::Result<Arc<dyn Trigger>> {
        let cfg: EventBusTriggerConfig = serde_json::from_value(cfg.clone())?;
        if cfg.pattern.trim().is_empty() {
            anyhow::bail!("eventbus trigger pattern must not be empty");
        }
        Ok(Arc::new(EventBusTrigger {
            name: format!("eventbus:{}", cfg.pattern),
            cfg,
            dispatcher: ctx.dispatcher(),
            events: ctx.events().clone(),
            handle: Mutex::new(None),
        }))
    }
}

#[async_trait]
impl Trigger for EventBusTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut stream = self.events.subscribe(self.cfg.pattern.clone());
        let dispatcher = self.dispatcher.clone();
        let workflow_type = self.cfg.workflow_type.clone();
        let action = self.cfg.action.clone();
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.recv() => {
                        let Some(event) = event else { break };
                        let mut data = into_data(event.data);
                        data.insert("topic".to_string(), serde_json::json!(event.topic));
                        if let Err(e) = dispatcher
                            .trigger_workflow(&workflow_type, &action, data)
                            .await
                        {
                            warn!(trigger = %name, error = %e, "Event bus trigger dispatch failed");
                        }
                    }
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
    use crate::broker::InProcessBroker;
    use flowkit::{EngineCtx, EventBus, ServiceRegistry};
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    struct Recording {
        fired: Arc<StdMutex<Vec<(String, String, JsonMap)>>>,
    }

    #[async_trait]
    impl WorkflowDispatcher for Recording {
        async fn trigger_workflow(
            &self,
            kind: &str,
            action: &str,
            data: JsonMap,
        ) -> anyhow::Result<JsonMap> {
            self.fired
                .lock()
                .unwrap()
                .push((kind.to_string(), action.to_string(), data));
            Ok(JsonMap::new())
        }
    }

    fn ctx_with(
        registry: Arc<ServiceRegistry>,
        events: EventBus,
        fired: Arc<StdMutex<Vec<(String, String, JsonMap)>>>,
    ) -> TriggerCtx {
        TriggerCtx::new(
            Arc::new(Recording { fired }),
            EngineCtx::new(registry, events, CancellationToken::new(), PathBuf::from(".")),
        )
    }

    #[tokio::test]
    async fn event_trigger_fires_on_publish() {
        let registry = Arc::new(ServiceRegistry::new());
        let broker: Arc<dyn MessageBroker> = Arc::new(InProcessBroker::new());
        registry.register("bus", broker.clone()).unwrap();

        let fired = Arc::new(StdMutex::new(Vec::new()));
        let ctx = ctx_with(registry, EventBus::new(), fired.clone());

        EventTrigger::from_config(
            &serde_json::json!({
                "topic": "orders",
                "workflowType": "pipeline:intake",
                "action": "run"
            }),
            &ctx,
        )
        .unwrap();

        broker
            .publish("orders", serde_json::json!({"id": 3}))
            .await
            .unwrap();

        let events = fired.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "pipeline:intake");
        assert_eq!(events[0].2["id"], 3);
        assert_eq!(events[0].2["topic"], "orders");
    }

    #[tokio::test]
    async fn eventbus_trigger_fires_on_matching_events() {
        let registry = Arc::new(ServiceRegistry::new());
        let events = EventBus::new();
        let fired = Arc::new(StdMutex::new(Vec::new()));
        let ctx = ctx_with(registry, events.clone(), fired.clone());

        let trigger = EventBusTrigger::from_config(
            &serde_json::json!({
                "pattern": "workflow.*",
                "workflowType": "messaging",
                "action": "audit"
            }),
            &ctx,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        trigger.start(cancel.clone()).await.unwrap();

        events.publish("workflow.completed", serde_json::json!({"kind": "http"}));
        events.publish("instance.created", serde_json::json!({}));

        // Let the trigger task drain the stream.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        trigger.stop().await.unwrap();

        let calls = fired.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "audit");
        assert_eq!(calls[0].2["topic"], "workflow.completed");
    }
}
