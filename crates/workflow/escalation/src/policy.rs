//! Level determination
//!
//! The level is the highest one any rule asks for. Every rule is a
//! threshold on a single input, so raising severity, elapsed time or the
//! retry count can only keep or raise the result.

use crate::config::EscalationPolicy;
use serde::{Deserialize, Serialize};
use workflow_types::{EscalationLevel, RoutingHint, Severity};

/// Everything level determination looks at
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelInputs {
    pub severity: Severity,
    /// Time since the instance was created (milliseconds)
    pub elapsed_ms: u64,
    pub sla_ms: u64,
    /// Escalations this step has already gone through
    pub retries: u32,
    pub complex: bool,
    pub vip: bool,
    pub requires_human: bool,
}

impl LevelInputs {
    pub fn from_hint(hint: &RoutingHint, policy: &EscalationPolicy, elapsed_ms: u64, retries: u32) -> Self {
        Self {
            severity: hint.severity,
            elapsed_ms,
            sla_ms: hint.sla_ms.unwrap_or(policy.default_sla_ms),
            retries,
            complex: hint.complex,
            vip: hint.vip,
            requires_human: hint.requires_human,
        }
    }

    pub fn sla_breached(&self) -> bool {
        self.elapsed_ms >= self.sla_ms
    }
}

/// A level decision and the rule that produced it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelDecision {
    pub level: EscalationLevel,
    pub reason: String,
}

impl EscalationPolicy {
    /// Compute the level a step should run at
    pub fn compute_level(&self, inputs: &LevelInputs) -> LevelDecision {
        let decision = |level, reason: &str| LevelDecision {
            level,
            reason: reason.to_string(),
        };

        if inputs.requires_human {
            return decision(EscalationLevel::Level4, "human handling requested");
        }
        if inputs.severity >= Severity::High {
            return decision(EscalationLevel::Level3, "high severity");
        }
        if inputs.sla_breached() {
            return decision(EscalationLevel::Level3, "sla breached");
        }
        if inputs.vip {
            return decision(EscalationLevel::Level3, "priority customer");
        }
        if inputs.retries > self.retry_threshold {
            return decision(EscalationLevel::Level2, "retry threshold exceeded");
        }
        if inputs.complex {
            return decision(EscalationLevel::Level2, "complex transition");
        }
        decision(EscalationLevel::Level1, "default path")
    }

    /// Workers to route at `level`. `None` means every capable worker.
    pub fn routing_width(&self, level: EscalationLevel) -> Option<usize> {
        match level {
            EscalationLevel::Level1 => Some(self.level1_width),
            EscalationLevel::Level2 => Some(self.level2_width),
            EscalationLevel::Level3 => None,
            EscalationLevel::Level4 => Some(0),
        }
    }
}
