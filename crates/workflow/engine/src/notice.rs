//! Payload carried by side-effect notifications

use serde::{Deserialize, Serialize};
use workflow_types::{
    AgentMessage, EventId, InstanceId, RoutingHint, StateId, TemplateId,
};

/// What a side-effect message tells its receivers about the commit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionNotice {
    pub instance_id: InstanceId,
    pub template_id: TemplateId,
    pub event: EventId,
    pub from_state: StateId,
    pub to_state: StateId,
    /// Payload of the event that caused the transition
    pub payload: serde_json::Value,
    /// Set when the orchestrator has a step to route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingHint>,
}

impl TransitionNotice {
    /// Decode the notice from a side-effect message
    pub fn from_message(message: &AgentMessage) -> Option<Self> {
        serde_json::from_value(message.payload.clone()).ok()
    }
}
