//! Dead-letter sinks
//!
//! Messages that exhaust their delivery attempts are parked here for
//! audit. Sinks are append-only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use workflow_types::AgentMessage;

/// A message that exhausted delivery retries
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: AgentMessage,
    pub attempts: u32,
    /// Error from the final attempt
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Trait for dead-letter sinks
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Append a dead letter
    async fn record(&self, letter: DeadLetter);

    /// All dead letters, oldest first
    async fn entries(&self) -> Vec<DeadLetter>;

    async fn count(&self) -> usize {
        self.entries().await.len()
    }
}

/// In-memory dead-letter log
#[derive(Default)]
pub struct MemoryDeadLetterLog {
    entries: RwLock<Vec<DeadLetter>>,
}

impl MemoryDeadLetterLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterLog {
    async fn record(&self, letter: DeadLetter) {
        self.entries.write().push(letter);
    }

    async fn entries(&self) -> Vec<DeadLetter> {
        self.entries.read().clone()
    }

    async fn count(&self) -> usize {
        self.entries.read().len()
    }
}
