//! Escalation orchestrator
//!
//! Drives one [`EscalationStep`] per routed notification: decide a level,
//! pick workers through the capability registry, send them requests over
//! the bus, aggregate what comes back and either resolve, re-route the
//! missing portion or escalate. Every decision is appended to the owning
//! instance's history through the engine.

use crate::config::OrchestratorConfig;
use crate::error::{EscalationError, EscalationResult};
use crate::human::{FailureNotifier, HumanAck, HumanEscalation, StepContext};
use crate::policy::LevelInputs;
use crate::step::{EscalationStep, StepState};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use workflow_bus::{BusError, BusEvent, DeadLetter, WorkerResponse};
use workflow_engine::{TransitionNotice, WorkflowEngine};
use workflow_registry::CapabilityRegistry;
use workflow_types::{
    AgentMessage, CapabilityTag, EscalationLevel, HistoryRecord, InstanceId, Priority,
    Recipient, RoutingHint, StepId, WorkerId,
};

// ── Step request / report ────────────────────────────────────────────

/// A unit of work to route
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRequest {
    pub instance_id: InstanceId,
    pub step_id: StepId,
    /// Message type of the requests sent to workers
    pub message_type: String,
    pub hint: RoutingHint,
    pub payload: serde_json::Value,
    pub priority: Priority,
}

impl StepRequest {
    pub fn new(instance_id: InstanceId, message_type: impl Into<String>, hint: RoutingHint) -> Self {
        Self {
            instance_id,
            step_id: StepId::generate(),
            message_type: message_type.into(),
            hint,
            payload: serde_json::Value::Null,
            priority: Priority::Normal,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Build a request from a routing notification published by the engine
    pub fn from_notification(message: &AgentMessage) -> Option<Self> {
        let notice = TransitionNotice::from_message(message)?;
        let hint = notice.routing.clone()?;
        Some(
            Self::new(notice.instance_id.clone(), message.message_type.clone(), hint)
                .with_payload(message.payload.clone())
                .with_priority(message.priority),
        )
    }
}

/// How a step ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Resolved,
    Failed,
}

/// Summary of a finished step
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: StepId,
    pub instance_id: InstanceId,
    pub outcome: StepOutcome,
    /// Level the step ended at
    pub level: EscalationLevel,
    pub retries: u32,
    /// States the step went through
    pub trail: Vec<StepState>,
    /// Every worker a request was sent to
    pub tried: Vec<WorkerId>,
    /// Responses of the final worker round
    pub responses: Vec<(WorkerId, WorkerResponse)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human: Option<HumanAck>,
}

/// What one round of requests produced
#[derive(Default)]
struct Round {
    responses: Vec<(WorkerId, WorkerResponse)>,
    missing: Vec<WorkerId>,
    failed: Vec<(WorkerId, String)>,
}

// ── Orchestrator ─────────────────────────────────────────────────────

/// Routes steps to workers and escalates them
pub struct EscalationOrchestrator {
    engine: Arc<WorkflowEngine>,
    registry: Arc<CapabilityRegistry>,
    human: Arc<dyn HumanEscalation>,
    notifier: Arc<dyn FailureNotifier>,
    config: OrchestratorConfig,
}

impl EscalationOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        engine: Arc<WorkflowEngine>,
        registry: Arc<CapabilityRegistry>,
        human: Arc<dyn HumanEscalation>,
        notifier: Arc<dyn FailureNotifier>,
    ) -> Self {
        Self {
            engine,
            registry,
            human,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run a step to completion.
    ///
    /// Returns the report of a resolved step. A step that a human could
    /// not resolve ends in `HumanEscalationRequired` after the failure
    /// notifier has been told.
    #[instrument(skip_all, fields(instance_id = %request.instance_id, step_id = %request.step_id))]
    pub async fn run_step(&self, request: StepRequest) -> EscalationResult<StepReport> {
        let mut step = EscalationStep::new(request.step_id.clone(), request.instance_id.clone());
        let mut tried: Vec<WorkerId> = Vec::new();
        let mut escalation_reason: Option<String> = None;

        loop {
            // evaluating
            let instance = self.engine.load_instance(&request.instance_id).await?;
            let elapsed_ms = instance.elapsed_ms().max(0) as u64;
            let inputs =
                LevelInputs::from_hint(&request.hint, &self.config.policy, elapsed_ms, step.retries);
            let decision = self.config.policy.compute_level(&inputs);
            let floor = step.level;
            let level = step.set_level(decision.level);
            let reason = match escalation_reason.take() {
                Some(reason) if level == floor => reason,
                _ => decision.reason,
            };

            info!(level = %level, reason = %reason, retries = step.retries, "Step level decided");
            self.record(
                &step,
                HistoryRecord::LevelDecided {
                    step_id: step.step_id.clone(),
                    level,
                    reason,
                },
            )
            .await?;

            if level.is_human() {
                return self.escalate_to_human(&mut step, &request, tried).await;
            }

            let round = self.route_level(&mut step, &request, &mut tried).await?;
            if round_resolved(&round) {
                step.advance(StepState::Resolved)?;
                self.record(
                    &step,
                    HistoryRecord::StepResolved {
                        step_id: step.step_id.clone(),
                        level,
                    },
                )
                .await?;
                info!(level = %level, workers = round.responses.len(), "Step resolved");
                return Ok(self.report(&step, StepOutcome::Resolved, tried, round.responses, None));
            }

            let reason = format!(
                "{} escalated: {} missing, {} failed, {} unresolved",
                level,
                round.missing.len(),
                round.failed.len(),
                round.responses.iter().filter(|(_, r)| !r.is_success()).count(),
            );
            warn!(level = %level, reason = %reason, "Step escalating");

            if level == EscalationLevel::Level3 {
                step.level3_rounds += 1;
            }
            let next = if level == EscalationLevel::Level3
                && step.level3_rounds < self.config.policy.level3_attempts
            {
                EscalationLevel::Level3
            } else {
                level.next()
            };

            step.advance(StepState::Escalated)?;
            step.set_level(next);
            step.advance(StepState::Evaluating)?;
            escalation_reason = Some(reason);
        }
    }

    /// Route, wait, and re-route the missing portion within one level
    async fn route_level(
        &self,
        step: &mut EscalationStep,
        request: &StepRequest,
        tried: &mut Vec<WorkerId>,
    ) -> EscalationResult<Round> {
        let capability = &request.hint.capability;
        let mut expected = self.select_workers(capability, step.level);

        step.advance(StepState::Routed)?;
        self.record(
            step,
            HistoryRecord::WorkersRouted {
                step_id: step.step_id.clone(),
                level: step.level,
                workers: expected.clone(),
            },
        )
        .await?;
        debug!(level = %step.level, workers = ?expected, "Workers routed");

        let mut result = Round::default();
        loop {
            tried.extend(expected.iter().cloned());
            step.advance(StepState::AwaitingResponses)?;
            let round = self.dispatch(request, step, &expected).await;
            step.advance(StepState::Aggregating)?;

            result.responses.extend(round.responses);
            result.failed.extend(round.failed);
            if round.missing.is_empty() {
                return Ok(result);
            }

            self.record(
                step,
                HistoryRecord::ResponsesMissing {
                    step_id: step.step_id.clone(),
                    workers: round.missing.clone(),
                },
            )
            .await?;

            let backups = if step.reroutes < self.config.reroute_budget {
                self.registry.select(capability, round.missing.len(), tried)
            } else {
                Vec::new()
            };
            if backups.is_empty() {
                result.missing = round.missing;
                return Ok(result);
            }

            step.reroutes += 1;
            for (from, to) in round.missing.iter().zip(&backups) {
                info!(from = %from, to = %to, "Re-routing missing response");
                self.record(
                    step,
                    HistoryRecord::Rerouted {
                        step_id: step.step_id.clone(),
                        from: from.clone(),
                        to: to.clone(),
                    },
                )
                .await?;
            }
            // Missing workers without a backup stay missing
            result.missing = round.missing.into_iter().skip(backups.len()).collect();
            step.advance(StepState::Routed)?;
            expected = backups;
        }
    }

    fn select_workers(&self, capability: &CapabilityTag, level: EscalationLevel) -> Vec<WorkerId> {
        match self.config.policy.routing_width(level) {
            Some(width) => self.registry.select(capability, width, &[]),
            None => {
                let all = self.registry.capable_workers(capability);
                self.registry.select(capability, all.len(), &[])
            }
        }
    }

    /// Send one request per worker and wait for all of them or the step timeout
    async fn dispatch(&self, request: &StepRequest, step: &EscalationStep, workers: &[WorkerId]) -> Round {
        let bus = self.engine.bus();
        let timeout = self.config.step_timeout();
        let payload = serde_json::json!({
            "step_id": step.step_id,
            "level": step.level,
            "capability": request.hint.capability,
            "request": request.payload,
        });

        let waits = workers.iter().map(|worker_id| {
            let message = AgentMessage::request(
                self.config.actor.clone(),
                Recipient::Worker(worker_id.clone()),
                request.message_type.clone(),
                payload.clone(),
            )
            .with_priority(request.priority)
            .with_instance(request.instance_id.clone());
            let pending = bus.request_handle(message);
            let worker_id = worker_id.clone();
            async move {
                let result = match pending {
                    Ok(pending) => pending.wait(timeout).await,
                    Err(err) => Err(err),
                };
                (worker_id, result)
            }
        });

        let mut round = Round::default();
        for (worker_id, result) in join_all(waits).await {
            match result {
                Ok(reply) => match WorkerResponse::from_message(&reply) {
                    Some(response) => round.responses.push((worker_id, response)),
                    None => round
                        .failed
                        .push((worker_id, "malformed worker response".to_string())),
                },
                Err(BusError::DeliveryTimeout { .. }) => round.missing.push(worker_id),
                Err(err) => {
                    warn!(worker_id = %worker_id, error = %err, "Step request failed");
                    round.failed.push((worker_id, err.to_string()));
                }
            }
        }
        round
    }

    async fn escalate_to_human(
        &self,
        step: &mut EscalationStep,
        request: &StepRequest,
        tried: Vec<WorkerId>,
    ) -> EscalationResult<StepReport> {
        step.advance(StepState::Routed)?;
        step.advance(StepState::AwaitingResponses)?;

        let context = StepContext {
            step_id: step.step_id.clone(),
            instance_id: step.instance_id.clone(),
            message_type: request.message_type.clone(),
            level: step.level,
            hint: request.hint.clone(),
            payload: request.payload.clone(),
            tried: tried.clone(),
        };
        info!("Escalating step to human desk");
        let ack = match tokio::time::timeout(
            self.config.human_timeout(),
            self.human.notify_human(&step.instance_id, &context),
        )
        .await
        {
            Ok(ack) => ack,
            Err(_) => {
                warn!(timeout_ms = self.config.human_timeout_ms, "Human escalation timed out");
                HumanAck::unresolved()
            }
        };

        step.advance(StepState::Aggregating)?;
        self.record(
            step,
            HistoryRecord::HumanEscalated {
                step_id: step.step_id.clone(),
                resolved: ack.resolved,
            },
        )
        .await?;

        if ack.resolved {
            step.advance(StepState::Resolved)?;
            self.record(
                step,
                HistoryRecord::StepResolved {
                    step_id: step.step_id.clone(),
                    level: step.level,
                },
            )
            .await?;
            info!("Step resolved by human desk");
            return Ok(self.report(step, StepOutcome::Resolved, tried, Vec::new(), Some(ack)));
        }

        step.advance(StepState::Failed)?;
        self.record(
            step,
            HistoryRecord::StepFailed {
                step_id: step.step_id.clone(),
                reason: "human escalation unresolved".to_string(),
            },
        )
        .await?;
        let report = self.report(step, StepOutcome::Failed, tried, Vec::new(), Some(ack));
        error!("Step failed after human escalation");
        self.notifier.step_failed(&report).await;

        Err(EscalationError::HumanEscalationRequired {
            instance_id: step.instance_id.clone(),
            step_id: step.step_id.clone(),
        })
    }

    async fn record(&self, step: &EscalationStep, record: HistoryRecord) -> EscalationResult<()> {
        self.engine
            .append_history(&step.instance_id, Some(self.config.actor.clone()), record)
            .await?;
        Ok(())
    }

    fn report(
        &self,
        step: &EscalationStep,
        outcome: StepOutcome,
        tried: Vec<WorkerId>,
        responses: Vec<(WorkerId, WorkerResponse)>,
        human: Option<HumanAck>,
    ) -> StepReport {
        StepReport {
            step_id: step.step_id.clone(),
            instance_id: step.instance_id.clone(),
            outcome,
            level: step.level,
            retries: step.retries,
            trail: step.trail.clone(),
            tried,
            responses,
            human,
        }
    }

    // ── Bus listener ─────────────────────────────────────────────────

    /// Consume routing notifications and dead-letter events.
    ///
    /// Each routing notification runs as its own step task. Dead letters
    /// that belong to an instance are appended to its history.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = self.engine.bus().clone();
        let channel = self.engine.config().routing_channel();
        let mut routing = bus.subscribe(channel.clone(), Vec::<String>::new());
        let mut events = bus.events();
        let orchestrator = self.clone();

        info!(channel = %channel, "Orchestrator listener started");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = routing.recv() => match message {
                        Some(message) => orchestrator.on_routing(message),
                        None => break,
                    },
                    event = events.recv() => match event {
                        Ok(BusEvent::DeadLettered(letter)) => orchestrator.on_dead_letter(letter).await,
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Orchestrator lagged behind bus events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Orchestrator listener stopped");
        })
    }

    fn on_routing(self: &Arc<Self>, message: AgentMessage) {
        let Some(request) = StepRequest::from_notification(&message) else {
            debug!(message_id = %message.id, "Routing message without a routing hint ignored");
            return;
        };
        let orchestrator = self.clone();
        tokio::spawn(async move {
            match orchestrator.run_step(request).await {
                Ok(report) => debug!(step_id = %report.step_id, level = %report.level, "Step finished"),
                Err(err) => error!(error = %err, "Step ended without resolution"),
            }
        });
    }

    async fn on_dead_letter(&self, letter: DeadLetter) {
        let Some(instance_id) = letter.message.instance_id.clone() else {
            return;
        };
        let record = HistoryRecord::Error {
            message: format!(
                "message {} ({}) dead-lettered after {} attempts: {}",
                letter.message.id, letter.message.message_type, letter.attempts, letter.reason
            ),
        };
        if let Err(err) = self
            .engine
            .append_history(&instance_id, Some(self.config.actor.clone()), record)
            .await
        {
            warn!(instance_id = %instance_id, error = %err, "Failed to record dead letter");
        }
    }
}

/// A round resolves when someone answered and every answer is a success
fn round_resolved(round: &Round) -> bool {
    !round.responses.is_empty()
        && round.missing.is_empty()
        && round.failed.is_empty()
        && round.responses.iter().all(|(_, r)| r.is_success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EscalationPolicy;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;
    use workflow_bus::{BusConfig, MessageBus, RetryPolicy, Worker, WorkerError};
    use workflow_engine::{EngineConfig, InMemoryStore};
    use workflow_types::{
        NotificationSpec, Severity, TemplateSpec, TransitionSpec, WorkflowInstance,
    };

    // ── Test workers ─────────────────────────────────────────────────

    enum Behaviour {
        Answer(WorkerResponse),
        Silent,
    }

    struct TestWorker {
        id: WorkerId,
        capabilities: BTreeSet<CapabilityTag>,
        behaviour: Behaviour,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl Worker for TestWorker {
        fn id(&self) -> WorkerId {
            self.id.clone()
        }

        fn capabilities(&self) -> BTreeSet<CapabilityTag> {
            self.capabilities.clone()
        }

        async fn handle(&self, _message: &AgentMessage) -> Result<WorkerResponse, WorkerError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            match &self.behaviour {
                Behaviour::Answer(response) => Ok(response.clone()),
                Behaviour::Silent => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Err(WorkerError::new("gave up"))
                }
            }
        }
    }

    struct Desk {
        ack: HumanAck,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HumanEscalation for Desk {
        async fn notify_human(&self, _instance_id: &InstanceId, _context: &StepContext) -> HumanAck {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.ack.clone()
        }
    }

    #[derive(Default)]
    struct Failures(Mutex<Vec<StepId>>);

    #[async_trait]
    impl FailureNotifier for Failures {
        async fn step_failed(&self, report: &StepReport) {
            self.0.lock().await.push(report.step_id.clone());
        }
    }

    struct Harness {
        engine: Arc<WorkflowEngine>,
        registry: Arc<CapabilityRegistry>,
        desk: Arc<Desk>,
        failures: Arc<Failures>,
        orchestrator: Arc<EscalationOrchestrator>,
    }

    impl Harness {
        fn new(ack: HumanAck) -> Self {
            let bus_config = BusConfig {
                retry: RetryPolicy {
                    jitter_ratio: 0.0,
                    ..Default::default()
                },
                ..Default::default()
            };
            let bus = MessageBus::new(bus_config);
            bus.start();
            let engine = Arc::new(WorkflowEngine::new(
                EngineConfig::default(),
                Arc::new(InMemoryStore::new()),
                bus,
            ));
            let registry = Arc::new(CapabilityRegistry::new());
            let desk = Arc::new(Desk {
                ack,
                calls: AtomicUsize::new(0),
            });
            let failures = Arc::new(Failures::default());
            let config = OrchestratorConfig {
                step_timeout_ms: 5_000,
                policy: EscalationPolicy::default(),
                ..Default::default()
            };
            let orchestrator = Arc::new(EscalationOrchestrator::new(
                config,
                engine.clone(),
                registry.clone(),
                desk.clone(),
                failures.clone(),
            ));
            Self {
                engine,
                registry,
                desk,
                failures,
                orchestrator,
            }
        }

        fn worker(&self, id: &str, capability: &str, behaviour: Behaviour) -> Arc<TestWorker> {
            let worker = Arc::new(TestWorker {
                id: WorkerId::new(id),
                capabilities: [CapabilityTag::new(capability)].into_iter().collect(),
                behaviour,
                handled: AtomicUsize::new(0),
            });
            self.engine.bus().attach(worker.clone());
            self.registry
                .register(worker.id(), worker.capabilities())
                .unwrap();
            worker
        }

        async fn instance(&self, spec: TemplateSpec) -> WorkflowInstance {
            let template_id = self.engine.register_template(spec).unwrap();
            self.engine
                .create_instance(&template_id, None, HashMap::new())
                .await
                .unwrap()
        }

        async fn history(&self, id: &InstanceId) -> Vec<HistoryRecord> {
            self.engine
                .load_instance(id)
                .await
                .unwrap()
                .history
                .into_iter()
                .map(|e| e.record)
                .collect()
        }
    }

    fn case_template() -> TemplateSpec {
        TemplateSpec::new("case", "open")
            .with_states(["open", "review", "closed"])
            .with_events(["submit", "close"])
            .with_terminal_states(["closed"])
            .with_transition(TransitionSpec::new("open", "review", "submit").with_side_effect(
                NotificationSpec::route("case.review", RoutingHint::new("billing")),
            ))
            .with_transition(TransitionSpec::new("review", "closed", "close"))
    }

    fn levels(history: &[HistoryRecord]) -> Vec<EscalationLevel> {
        history
            .iter()
            .filter_map(|r| match r {
                HistoryRecord::LevelDecided { level, .. } => Some(*level),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_level1_resolves() {
        let h = Harness::new(HumanAck::unresolved());
        let a = h.worker("a", "billing", Behaviour::Answer(WorkerResponse::success(json!({"ok": true}))));
        let instance = h.instance(case_template()).await;

        let report = h
            .orchestrator
            .run_step(StepRequest::new(instance.id.clone(), "case.review", RoutingHint::new("billing")))
            .await
            .unwrap();

        assert_eq!(report.outcome, StepOutcome::Resolved);
        assert_eq!(report.level, EscalationLevel::Level1);
        assert_eq!(report.tried, vec![WorkerId::new("a")]);
        assert_eq!(a.handled.load(Ordering::SeqCst), 1);
        assert_eq!(
            report.trail,
            vec![
                StepState::Evaluating,
                StepState::Routed,
                StepState::AwaitingResponses,
                StepState::Aggregating,
                StepState::Resolved,
            ]
        );

        let history = h.history(&instance.id).await;
        assert!(matches!(history.last(), Some(HistoryRecord::StepResolved { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_worker_rerouted_before_level2() {
        let h = Harness::new(HumanAck::unresolved());
        h.worker("a", "billing", Behaviour::Silent);
        h.worker("b", "billing", Behaviour::Silent);
        for id in ["c", "d", "e"] {
            h.worker(id, "billing", Behaviour::Answer(WorkerResponse::success(json!({}))));
        }
        let instance = h.instance(case_template()).await;

        let report = h
            .orchestrator
            .run_step(StepRequest::new(instance.id.clone(), "case.review", RoutingHint::new("billing")))
            .await
            .unwrap();

        assert_eq!(report.level, EscalationLevel::Level2);
        assert_eq!(report.retries, 1);

        let history = h.history(&instance.id).await;
        assert_eq!(levels(&history), vec![EscalationLevel::Level1, EscalationLevel::Level2]);

        let rerouted: Vec<(WorkerId, WorkerId)> = history
            .iter()
            .filter_map(|r| match r {
                HistoryRecord::Rerouted { from, to, .. } => Some((from.clone(), to.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(rerouted, vec![(WorkerId::new("a"), WorkerId::new("b"))]);

        // The re-route happened before the level changed
        let reroute_at = history
            .iter()
            .position(|r| matches!(r, HistoryRecord::Rerouted { .. }))
            .unwrap();
        let level2_at = history
            .iter()
            .position(|r| matches!(r, HistoryRecord::LevelDecided { level: EscalationLevel::Level2, .. }))
            .unwrap();
        assert!(reroute_at < level2_at);

        let mut routed_l2: Vec<WorkerId> = history
            .iter()
            .filter_map(|r| match r {
                HistoryRecord::WorkersRouted { level: EscalationLevel::Level2, workers, .. } => {
                    Some(workers.clone())
                }
                _ => None,
            })
            .flatten()
            .collect();
        routed_l2.sort();
        assert_eq!(routed_l2, vec![WorkerId::new("c"), WorkerId::new("d"), WorkerId::new("e")]);
    }

    #[tokio::test]
    async fn test_unresolved_climbs_every_level_to_human() {
        let h = Harness::new(HumanAck::resolved("handled by phone"));
        h.worker("x", "triage", Behaviour::Answer(WorkerResponse::unresolved(json!({}))));
        let instance = h.instance(case_template()).await;

        let report = h
            .orchestrator
            .run_step(StepRequest::new(instance.id.clone(), "case.triage", RoutingHint::new("triage")))
            .await
            .unwrap();

        assert_eq!(report.outcome, StepOutcome::Resolved);
        assert_eq!(report.level, EscalationLevel::Level4);
        assert_eq!(h.desk.calls.load(Ordering::SeqCst), 1);

        let history = h.history(&instance.id).await;
        assert_eq!(
            levels(&history),
            vec![
                EscalationLevel::Level1,
                EscalationLevel::Level2,
                EscalationLevel::Level3,
                EscalationLevel::Level4,
            ]
        );
        assert!(history
            .iter()
            .any(|r| matches!(r, HistoryRecord::HumanEscalated { resolved: true, .. })));
    }

    #[tokio::test]
    async fn test_human_unresolved_fails_step() {
        let h = Harness::new(HumanAck::unresolved());
        let instance = h.instance(case_template()).await;

        let hint = RoutingHint::new("billing").requires_human();
        let request = StepRequest::new(instance.id.clone(), "case.review", hint);
        let step_id = request.step_id.clone();
        let err = h.orchestrator.run_step(request).await.unwrap_err();

        assert!(matches!(err, EscalationError::HumanEscalationRequired { .. }));
        assert_eq!(h.failures.0.lock().await.clone(), vec![step_id]);

        let history = h.history(&instance.id).await;
        assert_eq!(levels(&history), vec![EscalationLevel::Level4]);
        assert!(matches!(history.last(), Some(HistoryRecord::StepFailed { .. })));
    }

    #[tokio::test]
    async fn test_high_severity_routes_to_all() {
        let h = Harness::new(HumanAck::unresolved());
        for id in ["a", "b", "c", "d", "e"] {
            h.worker(id, "billing", Behaviour::Answer(WorkerResponse::success(json!({}))));
        }
        let instance = h.instance(case_template()).await;

        let hint = RoutingHint::new("billing").with_severity(Severity::High);
        let report = h
            .orchestrator
            .run_step(StepRequest::new(instance.id, "case.review", hint))
            .await
            .unwrap();
        assert_eq!(report.level, EscalationLevel::Level3);
        assert_eq!(report.responses.len(), 5);
    }

    #[tokio::test]
    async fn test_listener_runs_routed_steps() {
        let h = Harness::new(HumanAck::unresolved());
        h.worker("a", "billing", Behaviour::Answer(WorkerResponse::success(json!({}))));
        let listener = h.orchestrator.spawn_listener();
        let instance = h.instance(case_template()).await;

        h.engine
            .apply_event(&instance.id, "submit".into(), json!({"customer": "acme"}))
            .await
            .unwrap();

        let mut resolved = false;
        for _ in 0..100 {
            let history = h.history(&instance.id).await;
            if history.iter().any(|r| matches!(r, HistoryRecord::StepResolved { .. })) {
                resolved = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(resolved);
        listener.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_records_dead_letters() {
        let h = Harness::new(HumanAck::unresolved());
        let listener = h.orchestrator.spawn_listener();
        let spec = TemplateSpec::new("mail", "draft")
            .with_states(["draft", "sent"])
            .with_events(["send"])
            .with_terminal_states(["sent"])
            .with_transition(
                TransitionSpec::new("draft", "sent", "send")
                    .with_side_effect(NotificationSpec::to_worker("mail.send", "ghost")),
            );
        let instance = h.instance(spec).await;

        h.engine
            .apply_event(&instance.id, "send".into(), json!({}))
            .await
            .unwrap();

        let mut recorded = false;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let history = h.history(&instance.id).await;
            if history.iter().any(|r| matches!(r, HistoryRecord::Error { .. })) {
                recorded = true;
                break;
            }
        }
        assert!(recorded);
        listener.abort();
    }
}
