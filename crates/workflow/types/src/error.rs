//! Error types shared by the engine and its stores

use crate::{EventId, InstanceId, StateId, TemplateId};
use thiserror::Error;

/// Template validation errors, raised at load time
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("Template has no id")]
    MissingId,

    #[error("Template declares no states")]
    NoStates,

    #[error("Undefined state: {0}")]
    UndefinedState(String),

    #[error("Undefined event: {0}")]
    UndefinedEvent(String),

    #[error("Duplicate transition for state '{state}' on event '{event}'")]
    DuplicateTransition { state: String, event: String },

    #[error("Transition out of terminal state '{state}' on event '{event}'")]
    TransitionFromTerminal { state: String, event: String },
}

/// Persistence errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Instance not found: {0}")]
    NotFound(InstanceId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Backend(String),
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// State machine engine errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("No transition from state '{state}' on event '{event}'")]
    InvalidTransition { state: StateId, event: EventId },

    #[error("Guard rejected transition: {reason}")]
    GuardRejected { reason: String },

    #[error("Timed out waiting for lock on instance {0}")]
    LockTimeout(InstanceId),

    #[error("Template not found: {0}")]
    TemplateNotFound(TemplateId),

    #[error("Template already registered: {0}")]
    TemplateAlreadyRegistered(TemplateId),

    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Invalid template: {0}")]
    InvalidTemplate(#[from] TemplateError),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => WorkflowError::InstanceNotFound(id),
            other => WorkflowError::Store(other),
        }
    }
}

/// Result type for workflow operations
pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;
