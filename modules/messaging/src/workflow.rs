use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use flowkit::{EngineCtx, JsonMap, WorkflowHandler};

use crate::broker::{MessageBroker, MessageHandler};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Section {
    #[serde(default)]
    broker: Option<String>,
    #[serde(default)]
    subscriptions: Vec<Subscription>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Subscription {
    topic: String,
    handler: String,
}

/// Workflow handler for the `messaging` kind: wires `subscriptions[]`
/// (topic → handler module) on the named broker. Executing the workflow
/// publishes the data map to the action's topic.
#[derive(Default)]
pub struct MessagingWorkflowHandler {
    broker: parking_lot::RwLock<Option<Arc<dyn MessageBroker>>>,
}

impl MessagingWorkflowHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowHandler for MessagingWorkflowHandler {
    fn can_handle(&self, kind: &str) -> bool {
        kind == "messaging"
    }

    async fn configure(&self, section: &serde_json::Value, ctx: &EngineCtx) -> anyhow::Result<()> {
        let section: Section = serde_json::from_value(section.clone())?;

        let broker: Arc<dyn MessageBroker> = match &section.broker {
            Some(name) => ctx.registry().get(name)?,
            None => {
                let mut brokers = ctx.registry().all_of::<Arc<dyn MessageBroker>>();
                match brokers.len() {
                    0 => anyhow::bail!("messaging workflow requires a 'messaging.broker' module"),
                    1 => brokers.remove(0).1,
                    n => anyhow::bail!("{n} brokers published; set 'broker' to pick one"),
                }
            }
        };

        for sub in &section.subscriptions {
            let handler: Arc<dyn MessageHandler> = ctx.registry().get(&sub.handler)?;
            broker.subscribe(&sub.topic, handler);
            info!(topic = %sub.topic, handler = %sub.handler, "Subscription wired");
        }

        *self.broker.write() = Some(broker);
        Ok(())
    }

    async fn execute(&self, _kind: &str, action: &str, data: JsonMap) -> anyhow::Result<JsonMap> {
        let broker = self
            .broker
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("messaging workflow is not configured"))?;
        broker
            .publish(action, serde_json::Value::Object(data))
            .await?;
        let mut out = JsonMap::new();
        out.insert("published".to_string(), serde_json::json!(true));
        out.insert("topic".to_string(), serde_json::json!(action));
        Ok(out)
    }
}
