//! Messaging: the in-process broker, the `messaging` workflow handler and
//! the event / event-bus triggers.

mod broker;
mod handler;
mod triggers;
mod workflow;

pub use broker::{InProcessBroker, MessageBroker, MessageHandler};
pub use handler::MessageHandlerModule;
pub use triggers::{EventBusTrigger, EventTrigger};
pub use workflow::MessagingWorkflowHandler;

use std::sync::Arc;

use flowkit::{Module, ModuleFactory, TriggerFactory};

/// Register this crate's module types with the engine factory.
pub fn register_module_types(factory: &mut ModuleFactory) {
    factory.register("messaging.broker", |cfg| {
        Ok(Arc::new(broker::BrokerModule::new(&cfg.name)) as Arc<dyn Module>)
    });
    factory.register("messaging.handler", |cfg| {
        Ok(Arc::new(MessageHandlerModule::new(&cfg.name)) as Arc<dyn Module>)
    });
}

/// Register the `event` (broker topic) and `eventbus` (in-process bus)
/// trigger kinds.
pub fn register_trigger_kinds(triggers: &mut TriggerFactory) {
    triggers.register("event", EventTrigger::from_config);
    triggers.register("eventbus", EventBusTrigger::from_config);
}
