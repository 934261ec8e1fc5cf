//! Workflow domain types
//!
//! Shared vocabulary for the workflow core: templates and their
//! transition tables, instances with append-only history, agent messages
//! carried by the bus, and the escalation levels used by the
//! orchestrator.
//!
//! These types are plain data. Behaviour lives in `workflow-engine`,
//! `workflow-bus`, `workflow-registry` and `workflow-escalation`.

#![deny(unsafe_code)]

pub mod error;
pub mod escalation;
pub mod guard;
pub mod ids;
pub mod instance;
pub mod message;
pub mod template;

pub use error::{StoreError, StoreResult, TemplateError, WorkflowError, WorkflowResult};
pub use escalation::{EscalationLevel, RoutingHint, Severity};
pub use guard::Guard;
pub use ids::{
    CapabilityTag, ChannelId, CorrelationId, EventId, InstanceId, MessageId, StateId, StepId,
    TemplateId, WorkerId,
};
pub use instance::{replay_signature, HistoryEntry, HistoryRecord, WorkflowInstance};
pub use message::{AgentMessage, DeliveryStatus, MessageKind, Priority, Recipient};
pub use template::{
    NotificationSpec, NotificationTarget, TemplateSpec, Transition, TransitionSpec,
    WorkflowTemplate,
};
