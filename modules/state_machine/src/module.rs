use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use flowkit::{
    wellknown, HealthCheck, HealthRegistry, Module, ModuleCtx, StatefulModule, WireableModule,
};

use crate::engine::StateMachineEngine;
use crate::store::InstanceStore;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateMachineEngineConfig {
    /// Service name of a persistence adapter to attach.
    #[serde(default)]
    pub store: Option<String>,
}

/// The `statemachine.engine` module: owns a [`StateMachineEngine`] and
/// publishes it under the module name.
pub struct StateMachineEngineModule {
    name: String,
    engine: ArcSwapOption<StateMachineEngine>,
    store_name: ArcSwapOption<String>,
}

impl StateMachineEngineModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            engine: ArcSwapOption::from(None),
            store_name: ArcSwapOption::from(None),
        }
    }

    pub fn engine(&self) -> Option<Arc<StateMachineEngine>> {
        self.engine.load_full()
    }
}

#[async_trait]
impl Module for StateMachineEngineModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        info!(module = %self.name, "Initializing state machine engine");
        let cfg: StateMachineEngineConfig = ctx.config()?;

        let engine = Arc::new(StateMachineEngine::new(
            ctx.registry().clone(),
            ctx.events().clone(),
        ));
        ctx.registry().register(self.name.clone(), engine.clone())?;

        self.engine.store(Some(engine));
        self.store_name.store(cfg.store.map(Arc::new));
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_stateful(&self) -> Option<&dyn StatefulModule> {
        Some(self)
    }

    fn as_wireable(&self) -> Option<&dyn WireableModule> {
        Some(self)
    }
}

impl WireableModule for StateMachineEngineModule {
    fn wire(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let engine = self
            .engine()
            .ok_or_else(|| anyhow::anyhow!("engine not initialized"))?;

        // The persistence module may sort after this one; the registry is
        // complete here, so the store binds now.
        if let Some(store_name) = self.store_name.load_full() {
            let store: Arc<dyn InstanceStore> = ctx.registry().get(store_name.as_str())?;
            engine.attach_store(store);
            info!(module = %self.name, store = %store_name, "Attached persistence store");
        }

        if let Ok(health) = ctx
            .registry()
            .get::<HealthRegistry>(wellknown::HEALTH_REGISTRY)
        {
            let name = self.name.clone();
            let engine = engine.clone();
            health.add_check(move || {
                if engine.persistence_degraded() {
                    HealthCheck::degraded(
                        name.clone(),
                        "instance persistence failing after state commit",
                    )
                } else {
                    HealthCheck::healthy(name.clone())
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StatefulModule for StateMachineEngineModule {
    async fn start(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        if let Some(engine) = self.engine() {
            let restored = engine.restore_from_store().await?;
            if restored > 0 {
                info!(module = %self.name, count = restored, "Instance restore complete");
            }
        }
        Ok(())
    }

    async fn stop(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }
}
