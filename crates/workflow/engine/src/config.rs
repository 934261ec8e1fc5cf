//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use workflow_types::ChannelId;

/// State machine engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long `apply_event` waits for a busy instance lock (milliseconds)
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Sender name on side-effect messages and default history actor
    #[serde(default = "default_actor")]
    pub actor: String,

    /// Channel side effects carrying a routing hint are published on.
    /// The orchestrator listens on the same channel.
    #[serde(default = "default_routing_channel")]
    pub routing_channel: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout(),
            actor: default_actor(),
            routing_channel: default_routing_channel(),
        }
    }
}

impl EngineConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn routing_channel(&self) -> ChannelId {
        ChannelId::new(self.routing_channel.clone())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.lock_timeout_ms == 0 {
            return Err("engine.lock_timeout_ms must be non-zero".into());
        }
        if self.actor.trim().is_empty() {
            return Err("engine.actor must not be empty".into());
        }
        if self.routing_channel.trim().is_empty() {
            return Err("engine.routing_channel must not be empty".into());
        }
        Ok(())
    }
}

fn default_lock_timeout() -> u64 {
    5_000
}

fn default_actor() -> String {
    "engine".to_string()
}

fn default_routing_channel() -> String {
    ChannelId::ROUTING.to_string()
}
