use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use flowkit::{Module, ModuleCtx};

/// Receives messages delivered by a broker subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: serde_json::Value) -> anyhow::Result<()>;
}

/// The broker capability. Delivery semantics (ordering, redelivery) are
/// provider-defined; the in-process broker delivers in publish order,
/// exactly once, on the publisher's task.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> anyhow::Result<()>;

    fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>);
}

/// Topic-keyed fan-out over registered handlers. Handler failures are
/// logged and do not stop delivery to the remaining subscribers.
#[derive(Default)]
pub struct InProcessBroker {
    subscriptions: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription_count(&self, topic: &str) -> usize {
        self.subscriptions
            .read()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBroker for InProcessBroker {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .subscriptions
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            if let Err(e) = handler.handle(topic, payload.clone()).await {
                warn!(topic, error = %e, "Message handler failed");
            }
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) {
        self.subscriptions
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(handler);
    }
}

/// The `messaging.broker` module: publishes an [`InProcessBroker`] under
/// the module name.
pub struct BrokerModule {
    name: String,
}

impl BrokerModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Module for BrokerModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let broker: Arc<dyn MessageBroker> = Arc::new(InProcessBroker::new());
        ctx.registry().register(self.name.clone(), broker)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
