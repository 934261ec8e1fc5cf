//! Workflow instances: running executions of a template
//!
//! An instance holds the current state and an append-only history. Every
//! committed transition and every orchestration decision lands in the
//! history, in commit order.

use crate::{EscalationLevel, EventId, InstanceId, StateId, StepId, TemplateId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Workflow Instance ────────────────────────────────────────────────

/// A running instance of a workflow template
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub template_id: TemplateId,
    pub current_state: StateId,
    /// Append-only record of transitions and orchestration decisions
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the instance reaches a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(template_id: TemplateId, initial_state: StateId) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::generate(),
            template_id,
            current_state: initial_state,
            history: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    pub fn with_id(mut self, id: InstanceId) -> Self {
        self.id = id;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Append a history entry and return its sequence number
    pub fn record(&mut self, actor: Option<String>, record: HistoryRecord) -> u64 {
        let sequence = self.history.len() as u64;
        let now = Utc::now();
        self.history.push(HistoryEntry {
            sequence,
            timestamp: now,
            actor,
            record,
        });
        self.updated_at = now;
        sequence
    }

    /// Move to `to` and record the transition that caused it
    pub fn apply_transition(
        &mut self,
        event: EventId,
        to: StateId,
        payload: serde_json::Value,
        actor: Option<String>,
    ) -> u64 {
        let signature = replay_signature(&event, &payload);
        let from = std::mem::replace(&mut self.current_state, to.clone());
        self.record(
            actor,
            HistoryRecord::Transition {
                event,
                from,
                to,
                payload,
                signature,
            },
        )
    }

    pub fn close(&mut self) {
        let now = Utc::now();
        self.closed_at = Some(now);
        self.updated_at = now;
    }

    // ── Query methods ────────────────────────────────────────────────

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// The most recent committed transition, if any
    pub fn last_transition(&self) -> Option<&HistoryEntry> {
        self.history
            .iter()
            .rev()
            .find(|entry| matches!(entry.record, HistoryRecord::Transition { .. }))
    }

    /// Whether `(event, payload)` re-delivers the last committed transition.
    ///
    /// True only when the instance has not moved since that transition.
    pub fn is_replay(&self, event: &EventId, payload: &serde_json::Value) -> bool {
        match self.last_transition().map(|entry| &entry.record) {
            Some(HistoryRecord::Transition {
                event: last_event,
                to,
                signature,
                ..
            }) => {
                last_event == event
                    && to == &self.current_state
                    && signature == &replay_signature(event, payload)
            }
            _ => false,
        }
    }

    pub fn transition_count(&self) -> usize {
        self.history
            .iter()
            .filter(|entry| matches!(entry.record, HistoryRecord::Transition { .. }))
            .count()
    }

    /// History entries belonging to one orchestrated step
    pub fn step_history(&self, step_id: &StepId) -> Vec<&HistoryEntry> {
        self.history
            .iter()
            .filter(|entry| entry.record.step_id() == Some(step_id))
            .collect()
    }

    pub fn elapsed_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.created_at)
            .num_milliseconds()
    }
}

/// Content signature of an event delivery.
///
/// The payload is serialized through `serde_json::Value`, whose object
/// maps are key-ordered, so logically equal payloads hash equally.
pub fn replay_signature(event: &EventId, payload: &serde_json::Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(event.as_str().as_bytes());
    hasher.update(&[0u8]);
    hasher.update(payload.to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

// ── History ──────────────────────────────────────────────────────────

/// One entry in an instance's history
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Position in the history, starting at 0
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Who caused this entry (a worker id, "orchestrator", ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub record: HistoryRecord,
}

/// What happened
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryRecord {
    Transition {
        event: EventId,
        from: StateId,
        to: StateId,
        payload: serde_json::Value,
        signature: String,
    },
    LevelDecided {
        step_id: StepId,
        level: EscalationLevel,
        reason: String,
    },
    WorkersRouted {
        step_id: StepId,
        level: EscalationLevel,
        workers: Vec<WorkerId>,
    },
    ResponsesMissing {
        step_id: StepId,
        workers: Vec<WorkerId>,
    },
    Rerouted {
        step_id: StepId,
        from: WorkerId,
        to: WorkerId,
    },
    StepResolved {
        step_id: StepId,
        level: EscalationLevel,
    },
    HumanEscalated {
        step_id: StepId,
        resolved: bool,
    },
    StepFailed {
        step_id: StepId,
        reason: String,
    },
    /// An orchestration error that did not change instance state
    Error { message: String },
}

impl HistoryRecord {
    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            HistoryRecord::LevelDecided { step_id, .. }
            | HistoryRecord::WorkersRouted { step_id, .. }
            | HistoryRecord::ResponsesMissing { step_id, .. }
            | HistoryRecord::Rerouted { step_id, .. }
            | HistoryRecord::StepResolved { step_id, .. }
            | HistoryRecord::HumanEscalated { step_id, .. }
            | HistoryRecord::StepFailed { step_id, .. } => Some(step_id),
            HistoryRecord::Transition { .. } | HistoryRecord::Error { .. } => None,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            HistoryRecord::Transition { .. } => "transition",
            HistoryRecord::LevelDecided { .. } => "level_decided",
            HistoryRecord::WorkersRouted { .. } => "workers_routed",
            HistoryRecord::ResponsesMissing { .. } => "responses_missing",
            HistoryRecord::Rerouted { .. } => "rerouted",
            HistoryRecord::StepResolved { .. } => "step_resolved",
            HistoryRecord::HumanEscalated { .. } => "human_escalated",
            HistoryRecord::StepFailed { .. } => "step_failed",
            HistoryRecord::Error { .. } => "error",
        }
    }
}
