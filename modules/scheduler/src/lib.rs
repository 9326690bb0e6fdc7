//! Scheduling: the `scheduler.modular` module, the `schedule` workflow
//! handler and the cron-driven schedule trigger.

mod module;
mod trigger;
mod workflow;

pub use module::{JobSpec, ModularScheduler, Schedule, SchedulerModule};
pub use trigger::ScheduleTrigger;
pub use workflow::SchedulerWorkflowHandler;

use std::sync::Arc;

use flowkit::{Module, ModuleFactory, TriggerFactory};

/// Register this crate's module types with the engine factory.
pub fn register_module_types(factory: &mut ModuleFactory) {
    factory.register("scheduler.modular", |cfg| {
        Ok(Arc::new(SchedulerModule::new(&cfg.name)) as Arc<dyn Module>)
    });
}

/// Register the `schedule` trigger kind.
pub fn register_trigger_kinds(triggers: &mut TriggerFactory) {
    triggers.register("schedule", ScheduleTrigger::from_config);
}
