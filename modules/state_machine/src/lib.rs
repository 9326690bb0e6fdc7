//! Persistent state machine engine: definitions, instances, atomic
//! transitions, hooks and pluggable persistence, plus the processing step
//! that bridges callable components to transitions.

mod definition;
mod engine;
mod error;
mod handler;
mod instance;
mod module;
mod processing;
mod store;

pub use definition::{HookDef, StateDef, StateMachineDefinition, TransitionDef};
pub use engine::StateMachineEngine;
pub use error::StateMachineError;
pub use handler::StateMachineWorkflowHandler;
pub use instance::{InstanceSnapshot, TransitionRecord};
pub use module::StateMachineEngineModule;
pub use processing::{ProcessingStep, ProcessingStepConfig};
pub use store::{InstanceStore, MemoryInstanceStore};

use flowkit::ModuleFactory;

/// Register this crate's module types with the engine factory.
pub fn register_module_types(factory: &mut ModuleFactory) {
    factory.register("statemachine.engine", |cfg| {
        Ok(std::sync::Arc::new(StateMachineEngineModule::new(&cfg.name))
            as std::sync::Arc<dyn flowkit::Module>)
    });
    factory.register("processing.step", |cfg| {
        Ok(std::sync::Arc::new(ProcessingStep::new(&cfg.name))
            as std::sync::Arc<dyn flowkit::Module>)
    });
}
