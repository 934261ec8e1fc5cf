//! Store collaborator: persistence for instances and messages
//!
//! The engine and orchestrator only ever call the four operations on
//! [`WorkflowStore`]. Physical storage lives behind the trait; the
//! in-memory adapter here is what tests and the default runtime use.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use workflow_types::{
    AgentMessage, HistoryEntry, HistoryRecord, InstanceId, StoreError, StoreResult,
    WorkflowInstance,
};

/// Persistence for workflow instances and dispatched messages
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Create or replace an instance, history included
    async fn save_instance(&self, instance: &WorkflowInstance) -> StoreResult<()>;

    async fn load_instance(&self, id: &InstanceId) -> StoreResult<Option<WorkflowInstance>>;

    /// Append one history entry to a stored instance
    async fn append_history(
        &self,
        id: &InstanceId,
        actor: Option<String>,
        record: HistoryRecord,
    ) -> StoreResult<HistoryEntry>;

    /// Record a message handed to the bus
    async fn save_message(&self, message: &AgentMessage) -> StoreResult<()>;
}

/// In-memory store for development and testing
#[derive(Debug, Default)]
pub struct InMemoryStore {
    instances: Arc<RwLock<HashMap<InstanceId, WorkflowInstance>>>,
    messages: Arc<RwLock<Vec<AgentMessage>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Every saved message, in save order
    pub async fn messages(&self) -> Vec<AgentMessage> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn save_instance(&self, instance: &WorkflowInstance) -> StoreResult<()> {
        let mut instances = self.instances.write().await;
        instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn load_instance(&self, id: &InstanceId) -> StoreResult<Option<WorkflowInstance>> {
        let instances = self.instances.read().await;
        Ok(instances.get(id).cloned())
    }

    async fn append_history(
        &self,
        id: &InstanceId,
        actor: Option<String>,
        record: HistoryRecord,
    ) -> StoreResult<HistoryEntry> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let sequence = instance.record(actor, record);
        instance
            .history
            .get(sequence as usize)
            .cloned()
            .ok_or_else(|| StoreError::Backend(format!("history entry {} missing after append", sequence)))
    }

    async fn save_message(&self, message: &AgentMessage) -> StoreResult<()> {
        self.messages.write().await.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_types::{Recipient, StateId, TemplateId};

    #[tokio::test]
    async fn test_save_and_load() {
        let store = InMemoryStore::new();
        let instance = WorkflowInstance::new(TemplateId::new("t"), StateId::new("a"));
        store.save_instance(&instance).await.unwrap();

        let loaded = store.load_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_state, StateId::new("a"));
        assert_eq!(store.instance_count().await, 1);
        assert!(store
            .load_instance(&InstanceId::new("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_append_history() {
        let store = InMemoryStore::new();
        let instance = WorkflowInstance::new(TemplateId::new("t"), StateId::new("a"));
        store.save_instance(&instance).await.unwrap();

        let entry = store
            .append_history(
                &instance.id,
                Some("orchestrator".into()),
                HistoryRecord::Error {
                    message: "worker unreachable".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(entry.sequence, 0);

        let loaded = store.load_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.history.len(), 1);

        let missing = store
            .append_history(&InstanceId::new("missing"), None, HistoryRecord::Error { message: "x".into() })
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_save_message() {
        let store = InMemoryStore::new();
        let msg = AgentMessage::new("engine", Recipient::Broadcast, "ping", serde_json::Value::Null);
        store.save_message(&msg).await.unwrap();
        assert_eq!(store.messages().await[0].id, msg.id);
    }
}
