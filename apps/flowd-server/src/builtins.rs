//! Assembles the closed set of built-in module types, trigger kinds and
//! workflow handlers the engine builds from.

use std::sync::Arc;

use flowkit::{EngineOptions, ModuleFactory, TriggerFactory, WorkflowHandler};
use flowkit_bootstrap::LogBuffer;

/// Every built-in module type tag, keyed for the factory.
pub fn module_factory(log_buffer: LogBuffer) -> ModuleFactory {
    let mut factory = ModuleFactory::new();
    http_gateway::register_module_types(&mut factory);
    http_gateway::register_log_collector(&mut factory, log_buffer);
    auth::register_module_types(&mut factory);
    messaging::register_module_types(&mut factory);
    scheduler::register_module_types(&mut factory);
    state_machine::register_module_types(&mut factory);
    persistence::register_module_types(&mut factory);
    dynamic_component::register_module_types(&mut factory);
    factory
}

pub fn trigger_factory() -> TriggerFactory {
    let mut triggers = TriggerFactory::new();
    http_gateway::register_trigger_kinds(&mut triggers);
    messaging::register_trigger_kinds(&mut triggers);
    scheduler::register_trigger_kinds(&mut triggers);
    triggers
}

/// One handler per workflow kind, in claim order.
pub fn workflow_handlers() -> Vec<Arc<dyn WorkflowHandler>> {
    vec![
        Arc::new(http_gateway::HttpWorkflowHandler::new()),
        Arc::new(messaging::MessagingWorkflowHandler::new()),
        Arc::new(state_machine::StateMachineWorkflowHandler::new()),
        Arc::new(scheduler::SchedulerWorkflowHandler::new()),
        Arc::new(pipeline::PipelineWorkflowHandler::new()),
        Arc::new(pipeline::IntegrationWorkflowHandler::new()),
        Arc::new(dynamic_component::EventWorkflowHandler::new()),
    ]
}

/// Full engine options for a workflow document at `base_dir`.
pub fn engine_options(
    log_buffer: LogBuffer,
    base_dir: std::path::PathBuf,
    cancel: tokio_util::sync::CancellationToken,
) -> EngineOptions {
    EngineOptions {
        factory: module_factory(log_buffer),
        triggers: trigger_factory(),
        handlers: workflow_handlers(),
        base_dir,
        cancel,
    }
}
