use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ModuleConfig;
use crate::contracts::{Module, Trigger, TriggerCtx};
use crate::error::EngineError;

type ModuleBuilder =
    Box<dyn Fn(&ModuleConfig) -> anyhow::Result<Arc<dyn Module>> + Send + Sync>;

/// Registry of module constructors keyed by `type` tag.
///
/// The closed set of known tags is whatever the application registered
/// before the build; an undeclared tag is a validation failure.
#[derive(Default)]
pub struct ModuleFactory {
    builders: HashMap<String, ModuleBuilder>,
}

impl ModuleFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, type_tag: impl Into<String>, builder: F)
    where
        F: Fn(&ModuleConfig) -> anyhow::Result<Arc<dyn Module>> + Send + Sync + 'static,
    {
        self.builders.insert(type_tag.into(), Box::new(builder));
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.builders.contains_key(type_tag)
    }

    pub fn build(&self, cfg: &ModuleConfig) -> Result<Arc<dyn Module>, EngineError> {
        let builder = self
            .builders
            .get(&cfg.type_tag)
            .ok_or_else(|| EngineError::UnknownType {
                module: cfg.name.clone(),
                type_tag: cfg.type_tag.clone(),
            })?;
        builder(cfg).map_err(|source| EngineError::Instantiate {
            module: cfg.name.clone(),
            source,
        })
    }

    /// Registered type tags, sorted (diagnostics).
    pub fn known_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.builders.keys().cloned().collect();
        tags.sort();
        tags
    }
}

type TriggerBuilder =
    Box<dyn Fn(&serde_json::Value, &TriggerCtx) -> anyhow::Result<Arc<dyn Trigger>> + Send + Sync>;

/// Registry of trigger constructors keyed by trigger kind
/// (`http`, `schedule`, `event`, `eventbus`).
#[derive(Default)]
pub struct TriggerFactory {
    builders: HashMap<String, TriggerBuilder>,
}

impl TriggerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, builder: F)
    where
        F: Fn(&serde_json::Value, &TriggerCtx) -> anyhow::Result<Arc<dyn Trigger>>
            + Send
            + Sync
            + 'static,
    {
        self.builders.insert(kind.into(), Box::new(builder));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    pub fn build(
        &self,
        kind: &str,
        cfg: &serde_json::Value,
        ctx: &TriggerCtx,
    ) -> Result<Arc<dyn Trigger>, EngineError> {
        let builder = self
            .builders
            .get(kind)
            .ok_or_else(|| EngineError::UnknownTriggerKind(kind.to_string()))?;
        builder(cfg, ctx).map_err(|source| EngineError::ConfigureTrigger {
            kind: kind.to_string(),
            source,
        })
    }
}
