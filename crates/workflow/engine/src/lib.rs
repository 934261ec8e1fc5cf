//! Workflow state machine engine
//!
//! Applies event-driven transitions to workflow instances. Templates are
//! compiled once and shared read-only; instance state is the only thing
//! that changes, and every change goes through [`WorkflowEngine`].
//!
//! # Guarantees
//!
//! - Transitions on one instance never interleave. Callers queue on a
//!   per-instance lock with a bounded wait.
//! - A rejected event (unknown pair or failed guard) never mutates state.
//! - Re-delivering the most recent transition is a no-op.
//! - Side effects reach the bus only after the commit is stored, and in
//!   commit order.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use workflow_bus::{BusConfig, MessageBus};
//! use workflow_engine::{EngineConfig, InMemoryStore, WorkflowEngine};
//! use workflow_types::{TemplateSpec, TransitionSpec};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = WorkflowEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(InMemoryStore::new()),
//!     MessageBus::new(BusConfig::default()),
//! );
//! let template_id = engine.register_template(
//!     TemplateSpec::new("booking", "inquiry")
//!         .with_states(["inquiry", "confirmed"])
//!         .with_events(["payment_received"])
//!         .with_terminal_states(["confirmed"])
//!         .with_transition(TransitionSpec::new("inquiry", "confirmed", "payment_received")),
//! )?;
//!
//! let instance = engine.create_instance(&template_id, None, HashMap::new()).await?;
//! let outcome = engine
//!     .apply_event(&instance.id, "payment_received".into(), serde_json::json!({}))
//!     .await?;
//! assert_eq!(outcome.new_state.as_str(), "confirmed");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod notice;
pub mod store;
pub mod template_registry;

pub use config::EngineConfig;
pub use engine::{TransitionOutcome, TriggerTarget, WorkflowEngine};
pub use notice::TransitionNotice;
pub use store::{InMemoryStore, WorkflowStore};
pub use template_registry::TemplateRegistry;
