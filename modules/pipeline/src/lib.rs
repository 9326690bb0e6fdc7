//! Pipelines: sequential step execution over a mutable context with
//! stop/skip/compensate error strategies, plus the `pipeline` and
//! `integration` workflow handlers.

mod engine;
mod handler;
mod integration;
mod steps;

pub use engine::{ErrorStrategy, Pipeline, PipelineStep, StepOutcome};
pub use handler::PipelineWorkflowHandler;
pub use integration::{ConnectorRegistry, IntegrationWorkflowHandler};
pub use steps::{StepConfig, StepRegistry};
