//! Outward interfaces: human escalation and failure notification

use crate::orchestrator::StepReport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use workflow_types::{EscalationLevel, InstanceId, RoutingHint, StepId, WorkerId};

/// What a human desk is told about a step it must take over
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepContext {
    pub step_id: StepId,
    pub instance_id: InstanceId,
    pub message_type: String,
    pub level: EscalationLevel,
    pub hint: RoutingHint,
    pub payload: serde_json::Value,
    /// Workers tried before the step reached a human
    pub tried: Vec<WorkerId>,
}

/// A human desk's answer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HumanAck {
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl HumanAck {
    pub fn resolved(note: impl Into<String>) -> Self {
        Self {
            resolved: true,
            note: Some(note.into()),
        }
    }

    pub fn unresolved() -> Self {
        Self {
            resolved: false,
            note: None,
        }
    }
}

/// Hand a step to people
#[async_trait]
pub trait HumanEscalation: Send + Sync {
    async fn notify_human(&self, instance_id: &InstanceId, context: &StepContext) -> HumanAck;
}

/// Told about steps that failed for good
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn step_failed(&self, report: &StepReport);
}
