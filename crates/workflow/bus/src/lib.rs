//! Priority-aware message bus for the workflow core
//!
//! The bus moves [`AgentMessage`](workflow_types::AgentMessage)s between
//! the engine, the orchestrator and attached [`Worker`]s.
//!
//! # Guarantees
//!
//! - `send` / `publish` enqueue without blocking the caller
//! - four priority tiers; a tier passed over `fairness_window` times is
//!   served ahead of higher tiers, so no tier starves
//! - FIFO within a priority tier; each worker and each subscription gets
//!   its messages in dequeue order, one settled before the next is tried
//! - at-least-once delivery with capped exponential backoff and jitter,
//!   then dead-lettering to an append-only [`DeadLetterSink`]; a full
//!   subscriber applies backpressure and is never silently skipped
//! - `request` matches exactly one response by correlation id, with a
//!   timeout and caller-side cancellation
//! - pub/sub recipients are fixed when a message is enqueued; dropping a
//!   [`Subscription`] unsubscribes it
//! - the delivery ledger keeps the most recent `ledger_retention` settled
//!   entries

#![deny(unsafe_code)]

pub mod bus;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod queue;
pub mod worker;

pub use bus::{
    BusEvent, DeliveryReceipt, DeliveryRecord, MessageBus, PendingReply, Subscription,
    SubscriptionId,
};
pub use config::{BusConfig, RetryPolicy};
pub use dead_letter::{DeadLetter, DeadLetterSink, MemoryDeadLetterLog};
pub use error::{BusError, BusResult};
pub use queue::PriorityQueues;
pub use worker::{ResponseStatus, Worker, WorkerError, WorkerResponse};
