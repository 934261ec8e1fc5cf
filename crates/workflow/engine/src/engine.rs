//! State machine engine: validated, serialized transitions
//!
//! Every instance has its own async lock. A transition loads the
//! instance, checks the `(state, event)` pair and the guard, commits the
//! new state through the store and only then hands the declared side
//! effects to the bus. Side effects are enqueued while the lock is still
//! held, so notifications for one instance leave in commit order.

use crate::config::EngineConfig;
use crate::notice::TransitionNotice;
use crate::store::WorkflowStore;
use crate::template_registry::TemplateRegistry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use workflow_bus::{BusResult, DeliveryReceipt, MessageBus};
use workflow_types::{
    AgentMessage, EventId, HistoryEntry, HistoryRecord, InstanceId, MessageId,
    NotificationSpec, NotificationTarget, Recipient, StateId, TemplateId, TemplateSpec,
    Transition, WorkflowError, WorkflowInstance, WorkflowResult, WorkflowTemplate,
};

/// Which instance a trigger applies to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerTarget {
    /// Create an instance of the template, but only if the event is valid
    /// from its initial state
    New { template_id: TemplateId },
    Existing(InstanceId),
}

/// Result of applying an event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub instance_id: InstanceId,
    pub from_state: StateId,
    pub new_state: StateId,
    /// The event re-delivered the last committed transition; nothing changed
    pub replayed: bool,
    /// The instance reached a terminal state
    pub closed: bool,
    /// Side-effect messages handed to the bus
    pub notifications: Vec<MessageId>,
}

type LockTable = DashMap<InstanceId, Arc<Mutex<()>>>;

/// Held for the duration of one instance mutation
struct InstanceGuard<'a> {
    instance_id: InstanceId,
    locks: &'a LockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Reclaim the entry once nobody else holds or waits on it
        self.locks
            .remove_if(&self.instance_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// The workflow state machine engine
pub struct WorkflowEngine {
    templates: TemplateRegistry,
    store: Arc<dyn WorkflowStore>,
    bus: MessageBus,
    locks: LockTable,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn WorkflowStore>, bus: MessageBus) -> Self {
        Self {
            templates: TemplateRegistry::new(),
            store,
            bus,
            locks: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    // ── Templates ────────────────────────────────────────────────────

    /// Validate and register a template
    pub fn register_template(&self, spec: TemplateSpec) -> WorkflowResult<TemplateId> {
        self.templates.register(spec)
    }

    pub fn template(&self, id: &TemplateId) -> WorkflowResult<Arc<WorkflowTemplate>> {
        self.templates.get(id)
    }

    // ── Instances ────────────────────────────────────────────────────

    /// Create and store a new instance in the template's initial state
    pub async fn create_instance(
        &self,
        template_id: &TemplateId,
        actor: Option<String>,
        metadata: HashMap<String, String>,
    ) -> WorkflowResult<WorkflowInstance> {
        let template = self.templates.get(template_id)?;
        let instance = new_instance(&template, actor, metadata);
        self.store.save_instance(&instance).await?;
        info!(
            instance_id = %instance.id,
            template_id = %template_id,
            state = %instance.current_state,
            "Workflow instance created"
        );
        Ok(instance)
    }

    pub async fn load_instance(&self, id: &InstanceId) -> WorkflowResult<WorkflowInstance> {
        self.store
            .load_instance(id)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound(id.clone()))
    }

    /// Apply an event with the engine as the recorded actor
    pub async fn apply_event(
        &self,
        id: &InstanceId,
        event: EventId,
        payload: serde_json::Value,
    ) -> WorkflowResult<TransitionOutcome> {
        self.apply_event_as(id, event, payload, None).await
    }

    /// Apply an event to an instance.
    ///
    /// Rejected events leave the instance untouched. Re-delivery of the
    /// most recent transition is a no-op that reports the current state.
    #[instrument(skip_all, fields(instance_id = %id, event = %event))]
    pub async fn apply_event_as(
        &self,
        id: &InstanceId,
        event: EventId,
        payload: serde_json::Value,
        actor: Option<String>,
    ) -> WorkflowResult<TransitionOutcome> {
        let guard = self.lock_instance(id).await?;

        let mut instance = self.load_instance(id).await?;
        let template = self.templates.get(&instance.template_id)?;

        if instance.is_replay(&event, &payload) {
            debug!("Event re-delivered, transition already committed");
            return Ok(TransitionOutcome {
                instance_id: instance.id.clone(),
                from_state: instance.current_state.clone(),
                new_state: instance.current_state.clone(),
                replayed: true,
                closed: instance.is_closed(),
                notifications: Vec::new(),
            });
        }

        let transition = check_transition(&template, &instance, &event, &payload)?.clone();

        let from_state = instance.current_state.clone();
        let actor = actor.or_else(|| Some(self.config.actor.clone()));
        instance.apply_transition(event.clone(), transition.to.clone(), payload.clone(), actor);
        let closed = template.is_terminal(&transition.to);
        if closed {
            instance.close();
        }

        self.store.save_instance(&instance).await?;
        info!(
            from = %from_state,
            to = %transition.to,
            closed,
            "Transition committed"
        );

        let notice = TransitionNotice {
            instance_id: instance.id.clone(),
            template_id: instance.template_id.clone(),
            event,
            from_state: from_state.clone(),
            to_state: transition.to.clone(),
            payload,
            routing: None,
        };
        let dispatched = self.dispatch_side_effects(&transition, &notice);
        drop(guard);

        let notifications = self.record_dispatch(id, dispatched).await;

        Ok(TransitionOutcome {
            instance_id: instance.id,
            from_state,
            new_state: transition.to,
            replayed: false,
            closed,
            notifications,
        })
    }

    /// Trigger interface: apply an event to an existing instance or to a
    /// new one.
    ///
    /// For [`TriggerTarget::New`] the event and guard are checked against
    /// the initial state first, so a rejected trigger creates nothing.
    pub async fn trigger(
        &self,
        target: TriggerTarget,
        event: EventId,
        payload: serde_json::Value,
        actor: Option<String>,
    ) -> WorkflowResult<TransitionOutcome> {
        match target {
            TriggerTarget::Existing(id) => self.apply_event_as(&id, event, payload, actor).await,
            TriggerTarget::New { template_id } => {
                let template = self.templates.get(&template_id)?;
                let instance = new_instance(&template, actor.clone(), HashMap::new());
                check_transition(&template, &instance, &event, &payload)?;

                self.store.save_instance(&instance).await?;
                info!(
                    instance_id = %instance.id,
                    template_id = %template_id,
                    "Workflow instance created by trigger"
                );
                self.apply_event_as(&instance.id, event, payload, actor).await
            }
        }
    }

    /// Append a history entry under the instance lock
    pub async fn append_history(
        &self,
        id: &InstanceId,
        actor: Option<String>,
        record: HistoryRecord,
    ) -> WorkflowResult<HistoryEntry> {
        let _guard = self.lock_instance(id).await?;
        let entry = self.store.append_history(id, actor, record).await?;
        debug!(instance_id = %id, sequence = entry.sequence, kind = entry.record.kind(), "History appended");
        Ok(entry)
    }

    /// Instances whose lock entry is currently alive
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn lock_instance(&self, id: &InstanceId) -> WorkflowResult<InstanceGuard<'_>> {
        let lock = self.locks.entry(id.clone()).or_default().clone();
        let acquired = tokio::time::timeout(self.config.lock_timeout(), lock.lock_owned()).await;
        match acquired {
            Ok(guard) => Ok(InstanceGuard {
                instance_id: id.clone(),
                locks: &self.locks,
                guard: Some(guard),
            }),
            Err(_) => {
                warn!(
                    instance_id = %id,
                    timeout_ms = self.config.lock_timeout_ms,
                    "Instance lock wait exceeded"
                );
                Err(WorkflowError::LockTimeout(id.clone()))
            }
        }
    }

    /// Hand each side effect to the bus. Never blocks.
    fn dispatch_side_effects(
        &self,
        transition: &Transition,
        notice: &TransitionNotice,
    ) -> Vec<(AgentMessage, BusResult<DeliveryReceipt>)> {
        transition
            .side_effects
            .iter()
            .map(|effect| {
                let message = self.notification(effect, notice);
                let result = match &effect.target {
                    // Routed steps always go where the orchestrator listens
                    _ if effect.routing.is_some() => {
                        self.bus.publish(self.config.routing_channel(), message.clone())
                    }
                    NotificationTarget::Worker(_) | NotificationTarget::Broadcast => {
                        self.bus.send(message.clone())
                    }
                    NotificationTarget::Channel(channel) => {
                        self.bus.publish(channel.clone(), message.clone())
                    }
                };
                (message, result)
            })
            .collect()
    }

    fn notification(&self, effect: &NotificationSpec, notice: &TransitionNotice) -> AgentMessage {
        let recipient = match &effect.target {
            _ if effect.routing.is_some() => Recipient::Broadcast,
            NotificationTarget::Worker(worker_id) => Recipient::Worker(worker_id.clone()),
            NotificationTarget::Broadcast | NotificationTarget::Channel(_) => Recipient::Broadcast,
        };
        let notice = TransitionNotice {
            routing: effect.routing.clone(),
            ..notice.clone()
        };
        let payload = serde_json::to_value(&notice).unwrap_or(serde_json::Value::Null);
        AgentMessage::new(
            self.config.actor.clone(),
            recipient,
            effect.message_type.clone(),
            payload,
        )
        .with_priority(effect.priority)
        .with_instance(notice.instance_id)
    }

    /// Persist dispatched messages and audit failed dispatches
    async fn record_dispatch(
        &self,
        id: &InstanceId,
        dispatched: Vec<(AgentMessage, BusResult<DeliveryReceipt>)>,
    ) -> Vec<MessageId> {
        let mut notifications = Vec::with_capacity(dispatched.len());
        for (message, result) in dispatched {
            match result {
                Ok(receipt) => {
                    if let Err(err) = self.store.save_message(&message).await {
                        warn!(message_id = %message.id, error = %err, "Failed to store message");
                    }
                    debug!(
                        message_id = %message.id,
                        message_type = %message.message_type,
                        recipients = receipt.recipients,
                        "Side effect dispatched"
                    );
                    notifications.push(receipt.message_id);
                }
                Err(err) => {
                    warn!(
                        message_type = %message.message_type,
                        error = %err,
                        "Side effect dispatch failed"
                    );
                    let record = HistoryRecord::Error {
                        message: format!("dispatch of '{}' failed: {}", message.message_type, err),
                    };
                    if let Err(err) = self.append_history(id, Some(self.config.actor.clone()), record).await {
                        warn!(instance_id = %id, error = %err, "Failed to record dispatch error");
                    }
                }
            }
        }
        notifications
    }
}

fn new_instance(
    template: &WorkflowTemplate,
    actor: Option<String>,
    metadata: HashMap<String, String>,
) -> WorkflowInstance {
    let mut instance = WorkflowInstance::new(template.id.clone(), template.initial_state.clone());
    instance.metadata = metadata;
    if let Some(actor) = actor {
        instance.metadata.insert("created_by".to_string(), actor);
    }
    instance
}

/// Find the transition for `event` and run its guard
fn check_transition<'t>(
    template: &'t WorkflowTemplate,
    instance: &WorkflowInstance,
    event: &EventId,
    payload: &serde_json::Value,
) -> WorkflowResult<&'t Transition> {
    let transition = template
        .transition(&instance.current_state, event)
        .ok_or_else(|| WorkflowError::InvalidTransition {
            state: instance.current_state.clone(),
            event: event.clone(),
        })?;

    if let Some(guard) = &transition.guard {
        if let Err(reason) = guard.evaluate(payload, &instance.metadata) {
            warn!(instance_id = %instance.id, event = %event, reason = %reason, "Guard rejected transition");
            return Err(WorkflowError::GuardRejected { reason });
        }
    }
    Ok(transition)
}
