//! Workflow runtime: the composition root
//!
//! Wires one bus, one engine, one capability registry and one
//! orchestrator together. Nothing here is global; tests and embedders
//! can run as many independent runtimes as they like.

use crate::config::RuntimeConfig;
use crate::error::RuntimeResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use workflow_bus::{DeadLetterSink, MemoryDeadLetterLog, MessageBus, Worker};
use workflow_engine::{
    InMemoryStore, TransitionOutcome, TriggerTarget, WorkflowEngine, WorkflowStore,
};
use workflow_escalation::{
    EscalationOrchestrator, EscalationResult, FailureNotifier, HumanAck, HumanEscalation,
    StepContext, StepReport, StepRequest,
};
use workflow_registry::CapabilityRegistry;
use workflow_types::{
    EventId, InstanceId, TemplateId, TemplateSpec, WorkerId, WorkflowInstance, WorkflowResult,
};

// ── Default collaborators ────────────────────────────────────────────

/// Human desk used when none is configured. Never resolves anything.
pub struct UnavailableDesk;

#[async_trait]
impl HumanEscalation for UnavailableDesk {
    async fn notify_human(&self, instance_id: &InstanceId, context: &StepContext) -> HumanAck {
        warn!(
            instance_id = %instance_id,
            step_id = %context.step_id,
            "No human desk configured, escalation left unresolved"
        );
        HumanAck::unresolved()
    }
}

/// Failure notifier that only logs
pub struct LoggingNotifier;

#[async_trait]
impl FailureNotifier for LoggingNotifier {
    async fn step_failed(&self, report: &StepReport) {
        error!(
            instance_id = %report.instance_id,
            step_id = %report.step_id,
            level = %report.level,
            tried = report.tried.len(),
            "Workflow step failed"
        );
    }
}

// ── Builder ──────────────────────────────────────────────────────────

/// Builder for [`WorkflowRuntime`]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    store: Option<Arc<dyn WorkflowStore>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    human: Option<Arc<dyn HumanEscalation>>,
    notifier: Option<Arc<dyn FailureNotifier>>,
}

impl RuntimeBuilder {
    pub fn with_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn with_human_escalation(mut self, human: Arc<dyn HumanEscalation>) -> Self {
        self.human = Some(human);
        self
    }

    pub fn with_failure_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Validate the configuration and wire the components
    pub fn build(self) -> RuntimeResult<WorkflowRuntime> {
        self.config.validate()?;

        let dead_letters = self
            .dead_letters
            .unwrap_or_else(|| Arc::new(MemoryDeadLetterLog::new()));
        let bus = MessageBus::with_dead_letter_sink(self.config.bus.clone(), dead_letters);

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let engine = Arc::new(WorkflowEngine::new(
            self.config.engine.clone(),
            store,
            bus.clone(),
        ));

        let registry = Arc::new(CapabilityRegistry::new());
        let orchestrator = Arc::new(EscalationOrchestrator::new(
            self.config.orchestrator.clone(),
            engine.clone(),
            registry.clone(),
            self.human.unwrap_or_else(|| Arc::new(UnavailableDesk)),
            self.notifier.unwrap_or_else(|| Arc::new(LoggingNotifier)),
        ));

        Ok(WorkflowRuntime {
            config: self.config,
            bus,
            engine,
            registry,
            orchestrator,
            listener: Mutex::new(None),
        })
    }
}

// ── Runtime ──────────────────────────────────────────────────────────

/// A wired workflow core
pub struct WorkflowRuntime {
    config: RuntimeConfig,
    bus: MessageBus,
    engine: Arc<WorkflowEngine>,
    registry: Arc<CapabilityRegistry>,
    orchestrator: Arc<EscalationOrchestrator>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl WorkflowRuntime {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            store: None,
            dead_letters: None,
            human: None,
            notifier: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<EscalationOrchestrator> {
        &self.orchestrator
    }

    /// Start bus consumers and the orchestrator listener. Idempotent.
    pub fn start(&self) {
        self.bus.start();
        let mut listener = self.listener.lock();
        if listener.is_none() {
            *listener = Some(self.orchestrator.spawn_listener());
            info!("Workflow runtime started");
        }
    }

    /// Stop the listener and the bus. Pending requests fail with `ShutDown`.
    pub fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.bus.shutdown();
        info!("Workflow runtime stopped");
    }

    pub fn register_template(&self, spec: TemplateSpec) -> WorkflowResult<TemplateId> {
        self.engine.register_template(spec)
    }

    /// Register a worker's capabilities and attach its bus endpoint
    pub fn attach_worker(&self, worker: Arc<dyn Worker>) -> RuntimeResult<WorkerId> {
        let worker_id = worker.id();
        self.registry
            .register(worker_id.clone(), worker.capabilities())?;
        self.bus.attach(worker);
        Ok(worker_id)
    }

    pub fn detach_worker(&self, worker_id: &WorkerId) -> RuntimeResult<()> {
        self.bus.detach(worker_id);
        self.registry.deregister(worker_id)?;
        Ok(())
    }

    /// Trigger interface: apply `event` to an existing instance or a new one
    pub async fn trigger(
        &self,
        target: TriggerTarget,
        event: impl Into<EventId>,
        payload: serde_json::Value,
        actor: Option<String>,
    ) -> WorkflowResult<TransitionOutcome> {
        self.engine
            .trigger(target, event.into(), payload, actor)
            .await
    }

    pub async fn instance(&self, id: &InstanceId) -> WorkflowResult<WorkflowInstance> {
        self.engine.load_instance(id).await
    }

    /// Run a step directly instead of through a routing notification
    pub async fn run_step(&self, request: StepRequest) -> EscalationResult<StepReport> {
        self.orchestrator.run_step(request).await
    }
}

impl Drop for WorkflowRuntime {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use workflow_bus::{WorkerError, WorkerResponse};
    use workflow_types::{AgentMessage, CapabilityTag};

    struct Idle;

    #[async_trait]
    impl Worker for Idle {
        fn id(&self) -> WorkerId {
            WorkerId::new("idle")
        }

        fn capabilities(&self) -> BTreeSet<CapabilityTag> {
            [CapabilityTag::new("billing")].into_iter().collect()
        }

        async fn handle(&self, _message: &AgentMessage) -> Result<WorkerResponse, WorkerError> {
            Ok(WorkerResponse::success(serde_json::Value::Null))
        }
    }

    #[tokio::test]
    async fn test_attach_and_detach_worker() {
        let runtime = WorkflowRuntime::builder(RuntimeConfig::default()).build().unwrap();
        let worker_id = runtime.attach_worker(Arc::new(Idle)).unwrap();

        assert!(runtime.bus().is_attached(&worker_id));
        assert_eq!(
            runtime.registry().capable_workers(&CapabilityTag::new("billing")),
            vec![worker_id.clone()]
        );

        runtime.detach_worker(&worker_id).unwrap();
        assert!(!runtime.bus().is_attached(&worker_id));
        assert!(runtime.registry().is_empty());
        assert!(runtime.detach_worker(&worker_id).is_err());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let runtime = WorkflowRuntime::builder(RuntimeConfig::default()).build().unwrap();
        runtime.start();
        runtime.start();
        assert!(runtime.listener.lock().is_some());

        runtime.shutdown();
        assert!(runtime.listener.lock().is_none());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = RuntimeConfig::default();
        config.orchestrator.policy.level1_width = 0;
        assert!(WorkflowRuntime::builder(config).build().is_err());
    }
}
