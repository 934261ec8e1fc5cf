//! The worker interface
//!
//! Workers are bus consumers. The bus calls [`Worker::handle`] for every
//! message addressed to an attached worker; for requests, the returned
//! [`WorkerResponse`] travels back as a correlated response message.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use workflow_types::{AgentMessage, CapabilityTag, WorkerId};

/// Outcome a worker reports for a handled message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Failure,
    /// The worker handled the message but could not resolve the step
    Unresolved,
}

/// What a worker hands back from `handle`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkerResponse {
    pub fn success(payload: serde_json::Value) -> Self {
        Self {
            status: ResponseStatus::Success,
            payload,
        }
    }

    pub fn failure(payload: serde_json::Value) -> Self {
        Self {
            status: ResponseStatus::Failure,
            payload,
        }
    }

    pub fn unresolved(payload: serde_json::Value) -> Self {
        Self {
            status: ResponseStatus::Unresolved,
            payload,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Decode the response carried by a response message
    pub fn from_message(message: &AgentMessage) -> Option<Self> {
        serde_json::from_value(message.payload.clone()).ok()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status,
            "payload": self.payload,
        })
    }
}

/// A delivery attempt failed; the bus will retry
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct WorkerError(pub String);

impl WorkerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// A specialised agent attached to the bus
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> WorkerId;

    fn capabilities(&self) -> BTreeSet<CapabilityTag>;

    /// Handle one message. An `Err` counts as a failed delivery attempt.
    async fn handle(&self, message: &AgentMessage) -> Result<WorkerResponse, WorkerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_types::Recipient;

    #[test]
    fn test_response_roundtrip_through_message() {
        let req = AgentMessage::request(
            "orchestrator",
            Recipient::worker("w1"),
            "step.execute",
            serde_json::Value::Null,
        );
        let resp = WorkerResponse::unresolved(serde_json::json!({"note": "needs review"}));
        let msg = req.reply("w1", resp.to_value());

        let decoded = WorkerResponse::from_message(&msg).unwrap();
        assert_eq!(decoded, resp);
        assert!(!decoded.is_success());
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let resp: WorkerResponse = serde_json::from_str(r#"{"status": "success"}"#).unwrap();
        assert!(resp.is_success());
        assert!(resp.payload.is_null());
    }
}
