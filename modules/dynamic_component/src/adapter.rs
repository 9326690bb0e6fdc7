use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use flowkit::{CallContract, Callable, Module, ModuleCtx, WireableModule};

/// The contract the external interpreter satisfies: turn a component id
/// (and optional source) into a callable. Sandboxing — including refusing
/// disallowed imports — is the interpreter's concern, not the adapter's.
pub trait ComponentLoader: Send + Sync {
    fn load(&self, component_id: &str, source: Option<&str>) -> anyhow::Result<Arc<dyn Callable>>;
}

fn default_loader() -> String {
    "component-loader".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DynamicComponentConfig {
    /// Identifier handed to the loader.
    #[serde(rename = "componentID", alias = "componentId")]
    pub component_id: String,
    /// Source file, resolved against the config directory.
    #[serde(default)]
    pub source: Option<String>,
    /// Service names this component publishes under (module name is always
    /// included).
    #[serde(default)]
    pub provides: Vec<String>,
    /// Service names that must exist once wiring completes.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Service name of the interpreter bridge.
    #[serde(default = "default_loader")]
    pub loader: String,
}

struct LoadedComponent {
    inner: Arc<dyn Callable>,
    requires: Vec<String>,
    provides: Vec<String>,
}

#[async_trait]
impl Callable for LoadedComponent {
    async fn execute(&self, params: flowkit::JsonMap) -> anyhow::Result<flowkit::JsonMap> {
        self.inner.execute(params).await
    }

    fn contract(&self) -> CallContract {
        let mut contract = self.inner.contract();
        if contract.required.is_empty() {
            contract.required = self.requires.clone();
        }
        if contract.outputs.is_empty() {
            contract.outputs = self.provides.clone();
        }
        contract
    }
}

/// The `dynamic.component` module: loads a user callable through the
/// interpreter bridge and publishes it under every `provides` name.
pub struct DynamicComponentModule {
    name: String,
    requires: RwLock<Vec<String>>,
}

impl DynamicComponentModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            requires: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Module for DynamicComponentModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg: DynamicComponentConfig = ctx.config()?;
        *self.requires.write() = cfg.requires.clone();

        let loader: Arc<dyn ComponentLoader> = ctx.registry().get(&cfg.loader)?;

        let source = match &cfg.source {
            Some(path) => Some(std::fs::read_to_string(ctx.resolve_path(path))?),
            None => None,
        };
        let inner = loader.load(&cfg.component_id, source.as_deref())?;

        let component = Arc::new(LoadedComponent {
            inner,
            requires: cfg.requires.clone(),
            provides: cfg.provides.clone(),
        }) as Arc<dyn Callable>;

        ctx.registry().register(self.name.clone(), component.clone())?;
        for provided in &cfg.provides {
            if provided != &self.name {
                ctx.registry().register(provided.clone(), component.clone())?;
            }
        }

        info!(
            module = %self.name,
            component = %cfg.component_id,
            provides = cfg.provides.len(),
            "Dynamic component loaded"
        );
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_wireable(&self) -> Option<&dyn WireableModule> {
        Some(self)
    }
}

impl WireableModule for DynamicComponentModule {
    fn wire(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        // Declared requirements must be resolvable now that every module
        // has initialized.
        for required in self.requires.read().iter() {
            if !ctx.registry().contains(required) {
                anyhow::bail!(
                    "dynamic component '{}' requires unpublished service '{required}'",
                    self.name
                );
            }
        }
        Ok(())
    }
}
