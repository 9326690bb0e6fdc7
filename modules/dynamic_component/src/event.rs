use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flowkit::{
    Callable, EngineCtx, ErrorKind, EventBus, JsonMap, Module, ModuleCtx, StatefulModule,
    WorkflowError, WorkflowHandler,
};

/// An event-bus bridge: bindings from bus patterns to callables, pumped on
/// dedicated tasks between start and stop.
pub struct EventBridge {
    name: String,
    events: RwLock<Option<EventBus>>,
    bindings: Mutex<Vec<(String, Arc<dyn Callable>)>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBridge {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            events: RwLock::new(None),
            bindings: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Bind a bus pattern to a handler; effective at the next start.
    pub fn bind(&self, pattern: impl Into<String>, handler: Arc<dyn Callable>) {
        self.bindings.lock().push((pattern.into(), handler));
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.lock().len()
    }
}

/// The `event.adapter` module wrapping a shared [`EventBridge`].
pub struct EventBridgeModule {
    name: String,
    bridge: Arc<EventBridge>,
}

impl EventBridgeModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            bridge: Arc::new(EventBridge::new(name)),
        }
    }
}

#[async_trait]
impl Module for EventBridgeModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        *self.bridge.events.write() = Some(ctx.events().clone());
        ctx.registry().register(self.name.clone(), self.bridge.clone())?;
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
impl StatefulModule for EventBridgeModule {
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let events = self
            .bridge
            .events
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("event adapter '{}' not initialized", self.name))?;

        let bindings = self.bridge.bindings.lock().clone();
        let mut handles = self.bridge.handles.lock();
        for (pattern, handler) in bindings {
            let mut stream = events.subscribe(pattern.clone());
            let cancel = cancel.clone();
            let adapter = self.name.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = stream.recv() => {
                            let Some(event) = event else { break };
                            let mut params = match event.data {
                                serde_json::Value::Object(map) => map,
                                other => {
                                    let mut map = JsonMap::new();
                                    map.insert("payload".to_string(), other);
                                    map
                                }
                            };
                            params.insert("topic".to_string(), serde_json::json!(event.topic));
                            if let Err(e) = handler.execute(params).await {
                                warn!(adapter = %adapter, pattern = %pattern, error = %e, "Event handler failed");
                            }
                        }
                    }
                }
            }));
        }
        Ok(())
    }

    async fn stop(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        let handles: Vec<JoinHandle<()>> = self.bridge.handles.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Section {
    #[serde(default)]
    adapters: Vec<AdapterEntry>,
    #[serde(default)]
    handlers: Vec<HandlerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdapterEntry {
    /// Service name of an `event.adapter` module.
    adapter: String,
    pattern: String,
    handler: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HandlerEntry {
    name: String,
    /// Service name of the callable backing this handler.
    component: String,
}

/// Workflow handler for the `event` kind: defines named handlers and wires
/// adapters (event-bus bridges) to them. Executing invokes the handler
/// named by the action.
#[derive(Default)]
pub struct EventWorkflowHandler {
    handlers: RwLock<HashMap<String, Arc<dyn Callable>>>,
}

impl EventWorkflowHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowHandler for EventWorkflowHandler {
    fn can_handle(&self, kind: &str) -> bool {
        kind == "event"
    }

    async fn configure(&self, section: &serde_json::Value, ctx: &EngineCtx) -> anyhow::Result<()> {
        let section: Section = serde_json::from_value(section.clone())?;

        let mut named: HashMap<String, Arc<dyn Callable>> = HashMap::new();
        for entry in &section.handlers {
            let component: Arc<dyn Callable> = ctx.registry().get(&entry.component)?;
            named.insert(entry.name.clone(), component);
        }

        for entry in &section.adapters {
            let bridge: Arc<EventBridge> = ctx.registry().get(&entry.adapter)?;
            let handler = match named.get(&entry.handler) {
                Some(handler) => handler.clone(),
                None => ctx.registry().get(&entry.handler)?,
            };
            bridge.bind(entry.pattern.clone(), handler);
            info!(
                adapter = %entry.adapter,
                pattern = %entry.pattern,
                handler = %entry.handler,
                "Event adapter wired"
            );
        }

        self.handlers.write().extend(named);
        Ok(())
    }

    async fn execute(&self, _kind: &str, action: &str, data: JsonMap) -> anyhow::Result<JsonMap> {
        let handler = self.handlers.read().get(action).cloned().ok_or_else(|| {
            WorkflowError::new(
                ErrorKind::NotFound,
                format!("event handler '{action}' not found"),
            )
        })?;
        handler.execute(data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkit::ServiceRegistry;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    struct Capture(Arc<StdMutex<Vec<JsonMap>>>);

    #[async_trait]
    impl Callable for Capture {
        async fn execute(&self, params: JsonMap) -> anyhow::Result<JsonMap> {
            self.0.lock().unwrap().push(params);
            Ok(JsonMap::new())
        }
    }

    #[tokio::test]
    async fn bridge_pumps_events_to_bound_handlers_between_start_and_stop() {
        let registry = Arc::new(ServiceRegistry::new());
        let events = EventBus::new();

        let module = EventBridgeModule::new("bridge");
        let module_ctx = ModuleCtx::new(
            "bridge",
            serde_json::Value::Null,
            vec![],
            Default::default(),
            EngineCtx::new(
                registry.clone(),
                events.clone(),
                CancellationToken::new(),
                PathBuf::from("."),
            ),
        );
        module.init(&module_ctx).await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        registry
            .register("audit", Arc::new(Capture(seen.clone())) as Arc<dyn Callable>)
            .unwrap();

        let handler = EventWorkflowHandler::new();
        handler
            .configure(
                &serde_json::json!({
                    "handlers": [ { "name": "audit-handler", "component": "audit" } ],
                    "adapters": [
                        { "adapter": "bridge", "pattern": "workflow.*", "handler": "audit-handler" }
                    ]
                }),
                module_ctx.engine_ctx(),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        module.start(cancel.clone()).await.unwrap();

        events.publish("workflow.completed", serde_json::json!({ "kind": "http" }));
        events.publish("unrelated", serde_json::json!({}));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        cancel.cancel();
        module.stop(CancellationToken::new()).await.unwrap();

        let calls = seen.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["topic"], "workflow.completed");
        assert_eq!(calls[0]["kind"], "http");
    }

    #[tokio::test]
    async fn execute_invokes_named_handler() {
        let registry = Arc::new(ServiceRegistry::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        registry
            .register("audit", Arc::new(Capture(seen.clone())) as Arc<dyn Callable>)
            .unwrap();

        let handler = EventWorkflowHandler::new();
        handler
            .configure(
                &serde_json::json!({
                    "handlers": [ { "name": "audit-handler", "component": "audit" } ]
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

        handler
            .execute("event", "audit-handler", JsonMap::new())
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);

        let err = handler
            .execute("event", "ghost", JsonMap::new())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<WorkflowError>().is_some());
    }
}
