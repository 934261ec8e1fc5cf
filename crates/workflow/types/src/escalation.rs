//! Escalation vocabulary shared by templates, history and the orchestrator

use crate::CapabilityTag;
use serde::{Deserialize, Serialize};

/// Routing width / severity tier chosen for a workflow step.
///
/// Ordered: a higher level always involves at least as many workers
/// (or a human).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EscalationLevel {
    /// 1–2 capable workers, the default path
    Level1 = 1,
    /// 3–4 capable workers
    Level2 = 2,
    /// Every available worker holding the capability
    Level3 = 3,
    /// Human escalation
    Level4 = 4,
}

impl EscalationLevel {
    pub fn number(self) -> u8 {
        self as u8
    }

    /// The next level up, saturating at Level 4
    pub fn next(self) -> Self {
        match self {
            Self::Level1 => Self::Level2,
            Self::Level2 => Self::Level3,
            Self::Level3 | Self::Level4 => Self::Level4,
        }
    }

    pub fn is_human(self) -> bool {
        self == Self::Level4
    }
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.number())
    }
}

/// Severity tag carried by a transition's routing hint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Routing information attached to a side-effect notification.
///
/// Present only on notifications the orchestrator should act upon.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingHint {
    /// Capability every selected worker must hold
    pub capability: CapabilityTag,
    #[serde(default)]
    pub severity: Severity,
    /// Transition is tagged as complex (pushes routing to Level 2)
    #[serde(default)]
    pub complex: bool,
    /// Transition explicitly demands human handling (Level 4)
    #[serde(default)]
    pub requires_human: bool,
    /// Caller-supplied priority flag, e.g. a top-tier customer marker
    #[serde(default)]
    pub vip: bool,
    /// SLA target override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla_ms: Option<u64>,
}

impl RoutingHint {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: CapabilityTag::new(capability),
            severity: Severity::Medium,
            complex: false,
            requires_human: false,
            vip: false,
            sla_ms: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn complex(mut self) -> Self {
        self.complex = true;
        self
    }

    pub fn vip(mut self) -> Self {
        self.vip = true;
        self
    }

    pub fn requires_human(mut self) -> Self {
        self.requires_human = true;
        self
    }

    pub fn with_sla_ms(mut self, sla_ms: u64) -> Self {
        self.sla_ms = Some(sla_ms);
        self
    }
}
