//! Agent messages: the unit of transport on the message bus
//!
//! A message is immutable once delivered. Retries are further attempts
//! of the same message (same id, incremented `retry_count`), never new
//! messages.

use crate::{ChannelId, CorrelationId, InstanceId, MessageId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Priority ─────────────────────────────────────────────────────────

/// Delivery priority tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// All tiers, highest first
    pub const DESCENDING: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Queue slot for this tier (0 = urgent)
    pub fn index(self) -> usize {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::DESCENDING.get(index).copied()
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        write!(f, "{}", s)
    }
}

// ── Delivery status ──────────────────────────────────────────────────

/// Where a message is in its delivery lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Queued,
    Delivered,
    TimedOut,
    DeadLettered,
}

impl DeliveryStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Delivered | Self::DeadLettered)
    }
}

/// What role a message plays in a conversation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Expects a correlated response
    Request,
    /// Answers a request with the same correlation id
    Response,
    /// Fire-and-forget
    #[default]
    Notification,
}

/// Addressee of a message
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Worker(WorkerId),
    Broadcast,
}

impl Recipient {
    pub fn worker(id: impl Into<String>) -> Self {
        Self::Worker(WorkerId::new(id))
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Worker(id) => write!(f, "{}", id),
            Recipient::Broadcast => write!(f, "broadcast"),
        }
    }
}

// ── Agent message ────────────────────────────────────────────────────

/// A message moving between the engine, the orchestrator and workers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: MessageId,
    pub sender: String,
    pub recipient: Recipient,
    pub message_type: String,
    pub kind: MessageKind,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub correlation_id: CorrelationId,
    /// Channel the message travels on (FIFO is per channel and priority)
    #[serde(default)]
    pub channel: ChannelId,
    /// Workflow instance the message belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    pub created_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub retry_count: u32,
    /// Number of explicit worker-to-worker handoffs so far
    pub hop_count: u8,
}

impl AgentMessage {
    /// Create a fire-and-forget notification
    pub fn new(
        sender: impl Into<String>,
        recipient: Recipient,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            sender: sender.into(),
            recipient,
            message_type: message_type.into(),
            kind: MessageKind::Notification,
            priority: Priority::Normal,
            payload,
            correlation_id: CorrelationId::generate(),
            channel: ChannelId::direct(),
            instance_id: None,
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Queued,
            retry_count: 0,
            hop_count: 0,
        }
    }

    /// Create a request expecting one correlated response
    pub fn request(
        sender: impl Into<String>,
        recipient: Recipient,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let mut msg = Self::new(sender, recipient, message_type, payload);
        msg.kind = MessageKind::Request;
        msg
    }

    /// Build the response to this message.
    ///
    /// The response carries the request's correlation id and goes back
    /// to the request's sender.
    pub fn reply(&self, sender: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: MessageId::generate(),
            sender: sender.into(),
            recipient: Recipient::Worker(WorkerId::new(self.sender.clone())),
            message_type: format!("{}.response", self.message_type),
            kind: MessageKind::Response,
            priority: self.priority,
            payload,
            correlation_id: self.correlation_id.clone(),
            channel: self.channel.clone(),
            instance_id: self.instance_id.clone(),
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Queued,
            retry_count: 0,
            hop_count: self.hop_count,
        }
    }

    /// Hand the message on to another worker as an explicit new hop.
    ///
    /// Keeps the correlation id so the original requester still gets
    /// the answer.
    pub fn forwarded(&self, from: impl Into<String>, to: WorkerId) -> Self {
        Self {
            id: MessageId::generate(),
            sender: from.into(),
            recipient: Recipient::Worker(to),
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Queued,
            retry_count: 0,
            hop_count: self.hop_count.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_channel(mut self, channel: ChannelId) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_instance(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }

    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }
}
