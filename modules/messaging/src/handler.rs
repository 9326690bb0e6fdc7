use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use flowkit::{Callable, JsonMap, Module, ModuleCtx, ServiceRegistry};

use crate::broker::MessageHandler;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageHandlerConfig {
    /// Service name of a callable to delegate to; without one, deliveries
    /// are logged only.
    #[serde(default)]
    pub component: Option<String>,
}

struct DelegatingHandler {
    registry: Arc<ServiceRegistry>,
    component: Option<String>,
}

#[async_trait]
impl MessageHandler for DelegatingHandler {
    async fn handle(&self, topic: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        let Some(component) = &self.component else {
            info!(topic, payload = %payload, "Message received");
            return Ok(());
        };

        // Late binding: the component may be published after this handler.
        let callable: Arc<dyn Callable> = self.registry.get(component)?;

        let mut params = match payload {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = JsonMap::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        params.insert("topic".to_string(), serde_json::json!(topic));
        callable.execute(params).await.map(|_| ())
    }
}

/// The `messaging.handler` module: publishes a [`MessageHandler`] that
/// delegates deliveries to a callable. Redelivery-safe behavior is the
/// callable's responsibility (the broker may be at-least-once).
pub struct MessageHandlerModule {
    name: String,
}

impl MessageHandlerModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Module for MessageHandlerModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg: MessageHandlerConfig = ctx.config()?;
        let handler: Arc<dyn MessageHandler> = Arc::new(DelegatingHandler {
            registry: ctx.registry().clone(),
            component: cfg.component,
        });
        ctx.registry().register(self.name.clone(), handler)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
