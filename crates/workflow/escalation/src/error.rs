//! Orchestrator error types

use crate::step::StepState;
use thiserror::Error;
use workflow_bus::BusError;
use workflow_types::{EscalationLevel, InstanceId, StepId, WorkflowError};

/// Escalation orchestrator errors
#[derive(Debug, Error)]
pub enum EscalationError {
    /// Level 4 ended without a resolution. Final for the core.
    #[error("Step {step_id} of instance {instance_id} requires human resolution")]
    HumanEscalationRequired {
        instance_id: InstanceId,
        step_id: StepId,
    },

    #[error("Illegal step transition {from:?} -> {to:?} at {level}")]
    IllegalStepTransition {
        from: StepState,
        to: StepState,
        level: EscalationLevel,
    },

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Result type for orchestrator operations
pub type EscalationResult<T> = std::result::Result<T, EscalationError>;
