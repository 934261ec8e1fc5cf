//! Registry error types

use thiserror::Error;
use workflow_types::WorkerId;

/// Capability registry errors
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Worker already registered: {0}")]
    AlreadyRegistered(WorkerId),
}

/// Result type for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
