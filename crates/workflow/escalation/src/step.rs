//! Per-step escalation automaton
//!
//! ```text
//! evaluating -> routed -> awaiting_responses -> aggregating -> resolved
//!     ^                        ^                    |  |  |
//!     |                        +---- routed <-------+  |  +-> failed (L4 only)
//!     +------------------- escalated <-----------------+
//! ```
//!
//! The level of a step only ever goes up.

use crate::error::{EscalationError, EscalationResult};
use serde::{Deserialize, Serialize};
use workflow_types::{EscalationLevel, InstanceId, StepId};

/// Where a step is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Evaluating,
    Routed,
    AwaitingResponses,
    Aggregating,
    Resolved,
    Escalated,
    Failed,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Resolved | StepState::Failed)
    }
}

/// One routed unit of work and its escalation bookkeeping
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EscalationStep {
    pub step_id: StepId,
    pub instance_id: InstanceId,
    pub state: StepState,
    pub level: EscalationLevel,
    /// Escalations so far
    pub retries: u32,
    /// Re-routes used at the current level
    pub reroutes: u32,
    /// Unresolved rounds at Level 3
    pub level3_rounds: u32,
    /// Every state entered, initial state first
    pub trail: Vec<StepState>,
}

impl EscalationStep {
    pub fn new(step_id: StepId, instance_id: InstanceId) -> Self {
        Self {
            step_id,
            instance_id,
            state: StepState::Evaluating,
            level: EscalationLevel::Level1,
            retries: 0,
            reroutes: 0,
            level3_rounds: 0,
            trail: vec![StepState::Evaluating],
        }
    }

    /// Move to `to` if the edge is legal
    pub fn advance(&mut self, to: StepState) -> EscalationResult<()> {
        use StepState::*;
        let legal = match (self.state, to) {
            (Evaluating, Routed)
            | (Routed, AwaitingResponses)
            | (AwaitingResponses, Aggregating)
            | (Aggregating, Routed)
            | (Aggregating, Resolved)
            | (Aggregating, Escalated)
            | (Escalated, Evaluating) => true,
            (Aggregating, Failed) => self.level.is_human(),
            _ => false,
        };
        if !legal {
            return Err(EscalationError::IllegalStepTransition {
                from: self.state,
                to,
                level: self.level,
            });
        }

        if to == Escalated {
            self.retries += 1;
            self.reroutes = 0;
        }
        self.state = to;
        self.trail.push(to);
        Ok(())
    }

    /// Set the level for the next round. Never lowers it.
    pub fn set_level(&mut self, level: EscalationLevel) -> EscalationLevel {
        self.level = self.level.max(level);
        self.level
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
