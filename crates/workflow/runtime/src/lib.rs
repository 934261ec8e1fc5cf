//! Workflow runtime
//!
//! Composition root for the workflow core. Loads [`RuntimeConfig`],
//! initialises tracing and wires the message bus, the state machine
//! engine, the capability registry and the escalation orchestrator into
//! a [`WorkflowRuntime`].
//!
//! ```rust,no_run
//! use workflow_engine::TriggerTarget;
//! use workflow_runtime::{telemetry, RuntimeConfig, WorkflowRuntime};
//! use workflow_types::{TemplateId, TemplateSpec, TransitionSpec};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RuntimeConfig::load(Some("workflow.toml"))?;
//! telemetry::init_tracing(&config.logging);
//!
//! let runtime = WorkflowRuntime::builder(config).build()?;
//! runtime.register_template(
//!     TemplateSpec::new("booking", "inquiry")
//!         .with_states(["inquiry", "confirmed", "canceled"])
//!         .with_events(["payment_received", "timeout"])
//!         .with_terminal_states(["confirmed", "canceled"])
//!         .with_transition(TransitionSpec::new("inquiry", "confirmed", "payment_received"))
//!         .with_transition(TransitionSpec::new("inquiry", "canceled", "timeout")),
//! )?;
//! runtime.start();
//!
//! let outcome = runtime
//!     .trigger(
//!         TriggerTarget::New { template_id: TemplateId::new("booking") },
//!         "payment_received",
//!         serde_json::json!({ "amount": 120 }),
//!         Some("webhook".into()),
//!     )
//!     .await?;
//! println!("{} is now {}", outcome.instance_id, outcome.new_state);
//! runtime.shutdown();
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod runtime;
pub mod telemetry;

pub use config::{LoggingConfig, RuntimeConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use runtime::{LoggingNotifier, RuntimeBuilder, UnavailableDesk, WorkflowRuntime};
