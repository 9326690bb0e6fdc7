use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured errors for the engine build and run phases.
#[derive(Debug, Error)]
pub enum EngineError {
    // Build/validation errors
    #[error("duplicate module name '{0}'")]
    DuplicateModule(String),
    #[error("module '{module}' depends on unknown '{depends_on}'")]
    UnknownDependency { module: String, depends_on: String },
    #[error("unknown module type '{type_tag}' for module '{module}'")]
    UnknownType { module: String, type_tag: String },
    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
    #[error("no workflow handler claims kind '{0}'")]
    UnclaimedWorkflow(String),
    #[error("unknown trigger kind '{0}'")]
    UnknownTriggerKind(String),

    // Phase errors with module context
    #[error("instantiation failed for module '{module}'")]
    Instantiate {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("initialization failed for module '{module}'")]
    Init {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("wiring failed for module '{module}'")]
    Wire {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("workflow configuration failed for kind '{kind}'")]
    ConfigureWorkflow {
        kind: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("trigger configuration failed for '{kind}'")]
    ConfigureTrigger {
        kind: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("start failed for '{name}'")]
    Start {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("stop failed for '{name}'")]
    Stop {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration violation naming the offending path.
#[derive(Debug, Error)]
#[error("invalid configuration at '{path}': {message}")]
pub struct ConfigError {
    pub path: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Error kinds surfaced on user-visible edges (HTTP responses, logs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigInvalid,
    InitFailure,
    NotFound,
    InvalidTransition,
    Transient,
    Permanent,
    Cancelled,
    PersistenceDegraded,
}

/// A kinded failure raised by workflow handlers, carried through
/// `anyhow::Error` chains so edges (HTTP triggers) can map it to a status
/// code and structured body without knowing the originating crate.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct WorkflowError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: serde_json::Value,
}

impl WorkflowError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn http_status(&self) -> u16 {
        match self.kind {
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidTransition => 409,
            ErrorKind::ConfigInvalid => 400,
            ErrorKind::Permanent => 422,
            ErrorKind::Transient | ErrorKind::PersistenceDegraded => 503,
            ErrorKind::Cancelled => 499,
            ErrorKind::InitFailure => 500,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.kind,
            message: self.message.clone(),
            details: self.details.clone(),
        }
    }
}

/// The wire shape of a user-visible failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl ErrorBody {
    pub fn new(error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
