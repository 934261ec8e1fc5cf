//! Capability registry for workflow workers
//!
//! A directory of which worker can perform which task type and whether it
//! is currently available. The orchestrator selects workers from it with
//! least-recently-used rotation; the engine never touches it.

#![deny(unsafe_code)]

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::{Availability, CapabilityRegistry, WorkerEntry};
