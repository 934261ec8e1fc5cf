//! Escalation orchestrator for workflow steps
//!
//! A step is one routed unit of work. The orchestrator runs each step
//! through a small automaton (evaluating, routed, awaiting responses,
//! aggregating, then resolved, escalated or failed) and raises its
//! [`EscalationLevel`](workflow_types::EscalationLevel) until someone
//! resolves it:
//!
//! | Level | Routed to |
//! |-------|-----------|
//! | L1 | 1–2 capable workers |
//! | L2 | 3–4 capable workers |
//! | L3 | every capable worker |
//! | L4 | the human-escalation interface |
//!
//! Worker choice among equally capable candidates rotates
//! least-recently-used through the capability registry. Missing
//! responses are re-routed to a backup before the level goes up, and the
//! level never goes down within a step.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod human;
pub mod orchestrator;
pub mod policy;
pub mod step;

pub use config::{EscalationPolicy, OrchestratorConfig};
pub use error::{EscalationError, EscalationResult};
pub use human::{FailureNotifier, HumanAck, HumanEscalation, StepContext};
pub use orchestrator::{EscalationOrchestrator, StepOutcome, StepReport, StepRequest};
pub use policy::{LevelDecision, LevelInputs};
pub use step::{EscalationStep, StepState};
