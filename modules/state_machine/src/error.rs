use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("definition '{0}' is already registered")]
    DuplicateDefinition(String),

    #[error("definition '{0}' not found")]
    DefinitionNotFound(String),

    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("invalid definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("no such transition '{transition}' in definition '{definition}'")]
    NoSuchTransition {
        definition: String,
        transition: String,
    },

    #[error(
        "transition '{transition}' does not apply: instance is in state '{current}', expected '{from}'"
    )]
    InvalidTransition {
        transition: String,
        current: String,
        from: String,
    },

    #[error("instance '{id}' is in terminal state '{state}'")]
    Terminal { id: String, state: String },

    #[error("hook '{module}' failed for transition '{transition}'")]
    HookFailed {
        module: String,
        transition: String,
        #[source]
        source: anyhow::Error,
    },
}

impl StateMachineError {
    /// Stable failure code surfaced in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateDefinition(_) => "duplicate_definition",
            Self::DefinitionNotFound(_) => "definition_not_found",
            Self::InstanceNotFound(_) => "instance_not_found",
            Self::InvalidDefinition { .. } => "invalid_definition",
            Self::NoSuchTransition { .. } => "no_such_transition",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Terminal { .. } => "terminal",
            Self::HookFailed { .. } => "hook_failed",
        }
    }
}
