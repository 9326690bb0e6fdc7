use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use flowkit::{Callable, EngineCtx, ErrorKind, JsonMap, WorkflowError, WorkflowHandler};

/// Named external connectors (callables) grouped behind one registry
/// service, so integrations are addressable as `<registry>/<connector>`.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<String, Arc<dyn Callable>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, connector: Arc<dyn Callable>) {
        self.connectors.write().insert(name.into(), connector);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Callable>> {
        self.connectors.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Section {
    /// Service name for the connector registry; created and published on
    /// first use.
    #[serde(default = "default_registry_name")]
    registry: String,
    #[serde(default)]
    connectors: Vec<ConnectorEntry>,
}

fn default_registry_name() -> String {
    "connectors".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConnectorEntry {
    name: String,
    /// Service name of the callable backing this connector.
    component: String,
}

/// Workflow handler for the `integration` kind: registers `connectors[]`
/// with the named connector registry; executing invokes the connector
/// named by the action.
#[derive(Default)]
pub struct IntegrationWorkflowHandler {
    connectors: RwLock<Option<Arc<ConnectorRegistry>>>,
}

impl IntegrationWorkflowHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowHandler for IntegrationWorkflowHandler {
    fn can_handle(&self, kind: &str) -> bool {
        kind == "integration"
    }

    async fn configure(&self, section: &serde_json::Value, ctx: &EngineCtx) -> anyhow::Result<()> {
        let section: Section = serde_json::from_value(section.clone())?;

        let connectors: Arc<ConnectorRegistry> =
            match ctx.registry().get::<Arc<ConnectorRegistry>>(&section.registry) {
                Ok(existing) => existing,
                Err(_) => {
                    let fresh = Arc::new(ConnectorRegistry::new());
                    ctx.registry()
                        .register(section.registry.clone(), fresh.clone())?;
                    fresh
                }
            };

        for entry in &section.connectors {
            let component: Arc<dyn Callable> = ctx.registry().get(&entry.component)?;
            connectors.register(entry.name.clone(), component);
            info!(connector = %entry.name, component = %entry.component, "Connector registered");
        }

        *self.connectors.write() = Some(connectors);
        Ok(())
    }

    async fn execute(&self, _kind: &str, action: &str, data: JsonMap) -> anyhow::Result<JsonMap> {
        let connectors = self
            .connectors
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("integration workflow is not configured"))?;
        let connector = connectors.get(action).ok_or_else(|| {
            WorkflowError::new(
                ErrorKind::NotFound,
                format!("connector '{action}' not found"),
            )
        })?;
        connector.execute(data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkit::{EventBus, ServiceRegistry};
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    struct Echo;

    #[async_trait]
    impl Callable for Echo {
        async fn execute(&self, mut params: JsonMap) -> anyhow::Result<JsonMap> {
            params.insert("via".to_string(), serde_json::json!("crm"));
            Ok(params)
        }
    }

    #[tokio::test]
    async fn registers_and_invokes_connectors() {
        let registry = Arc::new(ServiceRegistry::new());
        registry
            .register("crm-client", Arc::new(Echo) as Arc<dyn Callable>)
            .unwrap();

        let handler = IntegrationWorkflowHandler::new();
        handler
            .configure(
                &serde_json::json!({
                    "connectors": [ { "name": "crm", "component": "crm-client" } ]
                }),
                &EngineCtx::new(
                    registry.clone(),
                    EventBus::new(),
                    CancellationToken::new(),
                    PathBuf::from("."),
                ),
            )
            .await
            .unwrap();

        // The connector registry is published for other consumers.
        let connectors: Arc<ConnectorRegistry> = registry.get("connectors").unwrap();
        assert_eq!(connectors.names(), vec!["crm"]);

        let mut data = JsonMap::new();
        data.insert("lead".to_string(), serde_json::json!("ada"));
        let out = handler.execute("integration", "crm", data).await.unwrap();
        assert_eq!(out["via"], "crm");
        assert_eq!(out["lead"], "ada");

        let err = handler
            .execute("integration", "ghost", JsonMap::new())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<WorkflowError>().is_some());
    }
}
