use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use flowkit::{EngineCtx, ErrorKind, JsonMap, WorkflowError, WorkflowHandler};

use crate::definition::StateMachineDefinition;
use crate::engine::StateMachineEngine;
use crate::error::StateMachineError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Section {
    /// Service name of the engine; optional when exactly one is published.
    #[serde(default)]
    engine: Option<String>,
    #[serde(default)]
    definitions: Vec<StateMachineDefinition>,
    /// Bootstrap instances created at configure time.
    #[serde(default)]
    instances: Vec<BootstrapInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BootstrapInstance {
    definition: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    data: JsonMap,
}

/// Workflow handler for the `statemachine` kind: registers definitions on
/// the named engine and turns actions into transitions.
#[derive(Default)]
pub struct StateMachineWorkflowHandler {
    engine: ArcSwapOption<StateMachineEngine>,
}

impl StateMachineWorkflowHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn engine(&self) -> Result<Arc<StateMachineEngine>, WorkflowError> {
        self.engine.load_full().ok_or_else(|| {
            WorkflowError::new(
                ErrorKind::NotFound,
                "no state machine engine configured for the statemachine workflow",
            )
        })
    }

    fn map_error(err: StateMachineError) -> WorkflowError {
        let kind = match &err {
            StateMachineError::InstanceNotFound(_)
            | StateMachineError::DefinitionNotFound(_)
            | StateMachineError::NoSuchTransition { .. } => ErrorKind::NotFound,
            StateMachineError::InvalidTransition { .. } | StateMachineError::Terminal { .. } => {
                ErrorKind::InvalidTransition
            }
            StateMachineError::DuplicateDefinition(_)
            | StateMachineError::InvalidDefinition { .. } => ErrorKind::ConfigInvalid,
            StateMachineError::HookFailed { .. } => ErrorKind::Permanent,
        };
        WorkflowError::new(kind, err.to_string())
            .with_details(serde_json::json!({ "code": err.code() }))
    }

    fn snapshot_response(snapshot: &crate::instance::InstanceSnapshot) -> JsonMap {
        let mut out = JsonMap::new();
        out.insert("id".to_string(), serde_json::json!(snapshot.id));
        out.insert("state".to_string(), serde_json::json!(snapshot.state));
        out.insert("counter".to_string(), serde_json::json!(snapshot.counter));
        out
    }
}

#[async_trait]
impl WorkflowHandler for StateMachineWorkflowHandler {
    fn can_handle(&self, kind: &str) -> bool {
        kind == "statemachine"
    }

    async fn configure(&self, section: &serde_json::Value, ctx: &EngineCtx) -> anyhow::Result<()> {
        let section: Section = serde_json::from_value(section.clone())?;

        let engine: Arc<StateMachineEngine> = match &section.engine {
            Some(name) => ctx.registry().get(name)?,
            None => {
                let mut engines = ctx.registry().all_of::<Arc<StateMachineEngine>>();
                match engines.len() {
                    0 => anyhow::bail!(
                        "statemachine workflow requires a 'statemachine.engine' module"
                    ),
                    1 => engines.remove(0).1,
                    n => anyhow::bail!(
                        "{n} state machine engines published; set 'engine' to pick one"
                    ),
                }
            }
        };

        for def in section.definitions {
            let name = def.name.clone();
            engine.register_definition(def)?;
            info!(definition = %name, "Workflow definition registered");
        }

        for instance in section.instances {
            match &instance.id {
                Some(id) => {
                    engine
                        .new_instance_with_id(&instance.definition, id, instance.data.clone())
                        .await?
                }
                None => {
                    engine
                        .new_instance(&instance.definition, instance.data.clone())
                        .await
                        .map(|_| ())?
                }
            }
        }

        self.engine.store(Some(engine));
        Ok(())
    }

    async fn execute(&self, _kind: &str, action: &str, mut data: JsonMap) -> anyhow::Result<JsonMap> {
        let engine = self.engine()?;

        if action == "create" {
            let definition = data
                .remove("definition")
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| {
                    WorkflowError::new(ErrorKind::ConfigInvalid, "missing 'definition' field")
                })?;
            let id = engine
                .new_instance(&definition, data)
                .await
                .map_err(Self::map_error)?;
            let snapshot = engine.query(&id).await.map_err(Self::map_error)?;
            return Ok(Self::snapshot_response(&snapshot));
        }

        let id = data
            .remove("id")
            .or_else(|| data.remove("instance_id"))
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| {
                WorkflowError::new(ErrorKind::ConfigInvalid, "missing instance 'id' field")
            })?;

        let snapshot = engine
            .trigger(&id, action, data)
            .await
            .map_err(Self::map_error)?;
        Ok(Self::snapshot_response(&snapshot))
    }
}
