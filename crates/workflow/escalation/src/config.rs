//! Orchestrator configuration and escalation policy settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Escalation orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Level thresholds and routing widths
    #[serde(default)]
    pub policy: EscalationPolicy,

    /// How long a routed step waits for responses (milliseconds)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_ms: u64,

    /// Re-routes of missing responses allowed per level
    #[serde(default = "default_reroute_budget")]
    pub reroute_budget: u32,

    /// Upper bound on the human-escalation call (milliseconds)
    #[serde(default = "default_human_timeout")]
    pub human_timeout_ms: u64,

    /// Sender name on requests and actor on history entries
    #[serde(default = "default_actor")]
    pub actor: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            policy: EscalationPolicy::default(),
            step_timeout_ms: default_step_timeout(),
            reroute_budget: default_reroute_budget(),
            human_timeout_ms: default_human_timeout(),
            actor: default_actor(),
        }
    }
}

impl OrchestratorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn human_timeout(&self) -> Duration {
        Duration::from_millis(self.human_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.step_timeout_ms == 0 || self.human_timeout_ms == 0 {
            return Err("orchestrator timeouts must be non-zero".into());
        }
        self.policy.validate()
    }
}

/// Thresholds for level determination and routing widths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Workers routed at Level 1 (1 or 2)
    #[serde(default = "default_level1_width")]
    pub level1_width: usize,

    /// Workers routed at Level 2 (3 or 4)
    #[serde(default = "default_level2_width")]
    pub level2_width: usize,

    /// Level 2 applies once a step's retries exceed this
    #[serde(default = "default_retry_threshold")]
    pub retry_threshold: u32,

    /// Unresolved Level 3 rounds before Level 4
    #[serde(default = "default_level3_attempts")]
    pub level3_attempts: u32,

    /// SLA target when the routing hint carries none (milliseconds)
    #[serde(default = "default_sla")]
    pub default_sla_ms: u64,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            level1_width: default_level1_width(),
            level2_width: default_level2_width(),
            retry_threshold: default_retry_threshold(),
            level3_attempts: default_level3_attempts(),
            default_sla_ms: default_sla(),
        }
    }
}

impl EscalationPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=2).contains(&self.level1_width) {
            return Err("orchestrator.policy.level1_width must be 1 or 2".into());
        }
        if !(3..=4).contains(&self.level2_width) {
            return Err("orchestrator.policy.level2_width must be 3 or 4".into());
        }
        if self.level3_attempts == 0 {
            return Err("orchestrator.policy.level3_attempts must be at least 1".into());
        }
        if self.default_sla_ms == 0 {
            return Err("orchestrator.policy.default_sla_ms must be non-zero".into());
        }
        Ok(())
    }
}

// Default value helpers
fn default_step_timeout() -> u64 {
    30_000
}

fn default_reroute_budget() -> u32 {
    1
}

fn default_human_timeout() -> u64 {
    15 * 60 * 1_000
}

fn default_actor() -> String {
    "orchestrator".to_string()
}

fn default_level1_width() -> usize {
    1
}

fn default_level2_width() -> usize {
    3
}

fn default_retry_threshold() -> u32 {
    1
}

fn default_level3_attempts() -> u32 {
    1
}

fn default_sla() -> u64 {
    4 * 60 * 60 * 1_000
}
