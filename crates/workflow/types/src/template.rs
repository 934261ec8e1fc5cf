//! Workflow templates: immutable transition tables
//!
//! Templates arrive as loosely typed [`TemplateSpec`] data (states,
//! events and an ordered list of transitions) and are compiled into a
//! [`WorkflowTemplate`]: a validated table `state → {event → transition}`.
//! A compiled template is never mutated and is shared across instances.

use crate::{
    ChannelId, EventId, Guard, Priority, RoutingHint, StateId, TemplateError, TemplateId, WorkerId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

// ── Side effects ─────────────────────────────────────────────────────

/// Where a side-effect notification is delivered
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum NotificationTarget {
    /// Point-to-point to one worker
    Worker(WorkerId),
    /// Every attached worker
    Broadcast,
    /// Every subscriber of a pub/sub channel
    Channel(ChannelId),
}

/// A notification emitted after a transition commits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationSpec {
    pub message_type: String,
    pub target: NotificationTarget,
    #[serde(default)]
    pub priority: Priority,
    /// Present when the orchestrator must route a step for this transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingHint>,
}

impl NotificationSpec {
    pub fn to_worker(message_type: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            target: NotificationTarget::Worker(WorkerId::new(worker)),
            priority: Priority::Normal,
            routing: None,
        }
    }

    pub fn to_channel(message_type: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            target: NotificationTarget::Channel(ChannelId::new(channel)),
            priority: Priority::Normal,
            routing: None,
        }
    }

    pub fn broadcast(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            target: NotificationTarget::Broadcast,
            priority: Priority::Normal,
            routing: None,
        }
    }

    /// A step the orchestrator must route.
    ///
    /// Effects carrying a routing hint are published on the engine's
    /// configured routing channel whatever their nominal target.
    pub fn route(message_type: impl Into<String>, hint: RoutingHint) -> Self {
        Self {
            message_type: message_type.into(),
            target: NotificationTarget::Channel(ChannelId::routing()),
            priority: Priority::Normal,
            routing: Some(hint),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

// ── Loose template data ──────────────────────────────────────────────

/// One transition as supplied in template configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionSpec {
    pub from: String,
    pub to: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub side_effects: Vec<NotificationSpec>,
}

impl TransitionSpec {
    pub fn new(from: impl Into<String>, to: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            event: event.into(),
            guard: None,
            side_effects: Vec::new(),
        }
    }

    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_side_effect(mut self, effect: NotificationSpec) -> Self {
        self.side_effects.push(effect);
        self
    }
}

/// A template as authored: plain lists, not yet validated
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub id: String,
    pub states: Vec<String>,
    pub events: Vec<String>,
    pub transitions: Vec<TransitionSpec>,
    pub initial_state: String,
    #[serde(default)]
    pub terminal_states: Vec<String>,
}

impl TemplateSpec {
    pub fn new(id: impl Into<String>, initial_state: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            states: Vec::new(),
            events: Vec::new(),
            transitions: Vec::new(),
            initial_state: initial_state.into(),
            terminal_states: Vec::new(),
        }
    }

    pub fn with_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states.extend(states.into_iter().map(Into::into));
        self
    }

    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events.extend(events.into_iter().map(Into::into));
        self
    }

    pub fn with_terminal_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.terminal_states
            .extend(states.into_iter().map(Into::into));
        self
    }

    pub fn with_transition(mut self, transition: TransitionSpec) -> Self {
        self.transitions.push(transition);
        self
    }
}

// ── Compiled template ────────────────────────────────────────────────

/// A validated transition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: StateId,
    pub to: StateId,
    pub event: EventId,
    pub guard: Option<Guard>,
    pub side_effects: Vec<NotificationSpec>,
}

/// An immutable, validated workflow template
#[derive(Clone, Debug, Serialize)]
pub struct WorkflowTemplate {
    pub id: TemplateId,
    pub states: BTreeSet<StateId>,
    pub events: BTreeSet<EventId>,
    /// Transitions in authoring order
    pub transitions: Vec<Transition>,
    pub initial_state: StateId,
    pub terminal_states: BTreeSet<StateId>,
    /// state → event → index into `transitions`
    #[serde(skip)]
    table: HashMap<StateId, HashMap<EventId, usize>>,
}

impl WorkflowTemplate {
    /// Validate template data and build the lookup table.
    ///
    /// Rejects any transition that references an undeclared state or
    /// event, duplicate `(from, event)` pairs, and transitions leaving
    /// a terminal state.
    pub fn compile(spec: TemplateSpec) -> Result<Self, TemplateError> {
        if spec.id.trim().is_empty() {
            return Err(TemplateError::MissingId);
        }
        if spec.states.is_empty() {
            return Err(TemplateError::NoStates);
        }

        let states: BTreeSet<StateId> = spec.states.iter().map(|s| StateId::new(s.as_str())).collect();
        let events: BTreeSet<EventId> = spec.events.iter().map(|e| EventId::new(e.as_str())).collect();

        let initial_state = StateId::new(spec.initial_state);
        if !states.contains(&initial_state) {
            return Err(TemplateError::UndefinedState(initial_state.0));
        }

        let mut terminal_states = BTreeSet::new();
        for s in spec.terminal_states {
            let state = StateId::new(s);
            if !states.contains(&state) {
                return Err(TemplateError::UndefinedState(state.0));
            }
            terminal_states.insert(state);
        }

        let mut transitions = Vec::with_capacity(spec.transitions.len());
        let mut table: HashMap<StateId, HashMap<EventId, usize>> = HashMap::new();

        for t in spec.transitions {
            let from = StateId::new(t.from);
            let to = StateId::new(t.to);
            let event = EventId::new(t.event);

            if !states.contains(&from) {
                return Err(TemplateError::UndefinedState(from.0));
            }
            if !states.contains(&to) {
                return Err(TemplateError::UndefinedState(to.0));
            }
            if !events.contains(&event) {
                return Err(TemplateError::UndefinedEvent(event.0));
            }
            if terminal_states.contains(&from) {
                return Err(TemplateError::TransitionFromTerminal {
                    state: from.0,
                    event: event.0,
                });
            }

            let by_event = table.entry(from.clone()).or_default();
            if by_event.contains_key(&event) {
                return Err(TemplateError::DuplicateTransition {
                    state: from.0,
                    event: event.0,
                });
            }
            by_event.insert(event.clone(), transitions.len());

            transitions.push(Transition {
                from,
                to,
                event,
                guard: t.guard,
                side_effects: t.side_effects,
            });
        }

        Ok(Self {
            id: TemplateId::new(spec.id),
            states,
            events,
            transitions,
            initial_state,
            terminal_states,
            table,
        })
    }

    /// Look up the transition for `(state, event)`
    pub fn transition(&self, state: &StateId, event: &EventId) -> Option<&Transition> {
        self.table
            .get(state)
            .and_then(|by_event| by_event.get(event))
            .and_then(|&idx| self.transitions.get(idx))
    }

    /// Events accepted from a state
    pub fn events_from(&self, state: &StateId) -> Vec<&EventId> {
        let mut events: Vec<&EventId> = self
            .table
            .get(state)
            .map(|by_event| by_event.keys().collect())
            .unwrap_or_default();
        events.sort();
        events
    }

    pub fn has_state(&self, state: &StateId) -> bool {
        self.states.contains(state)
    }

    pub fn is_terminal(&self, state: &StateId) -> bool {
        self.terminal_states.contains(state)
    }
}
