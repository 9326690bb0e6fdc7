//! Dynamic components: the adapter that wraps a sandbox-loaded callable in
//! the module contract, plus the `event` workflow kind (event-bus adapters
//! wired to named handlers).

mod adapter;
mod event;

pub use adapter::{ComponentLoader, DynamicComponentModule};
pub use event::{EventBridge, EventBridgeModule, EventWorkflowHandler};

use std::sync::Arc;

use flowkit::{Module, ModuleFactory};

/// Register this crate's module types with the engine factory.
pub fn register_module_types(factory: &mut ModuleFactory) {
    factory.register("dynamic.component", |cfg| {
        Ok(Arc::new(DynamicComponentModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("event.adapter", |cfg| {
        Ok(Arc::new(EventBridgeModule::new(&cfg.name)) as Arc<dyn Module>)
    });
}
