//! Bus error types

use workflow_types::{CorrelationId, MessageId};
use thiserror::Error;

/// Message bus errors
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("No response for correlation {correlation_id} within {timeout_ms}ms")]
    DeliveryTimeout {
        correlation_id: CorrelationId,
        timeout_ms: u64,
    },

    #[error("Message {message_id} dead-lettered after {attempts} attempts: {reason}")]
    DeadLetter {
        message_id: MessageId,
        attempts: u32,
        reason: String,
    },

    #[error("Request {0} was cancelled")]
    Cancelled(CorrelationId),

    #[error("A request with correlation {0} is already pending")]
    DuplicateCorrelation(CorrelationId),

    #[error("Message {message_id} exceeded hop limit ({hops} > {max})")]
    HopLimitExceeded {
        message_id: MessageId,
        hops: u8,
        max: u8,
    },

    #[error("Message bus is shut down")]
    ShutDown,
}

/// Result type for bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;
