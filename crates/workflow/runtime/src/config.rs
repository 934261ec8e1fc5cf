//! Runtime configuration
//!
//! Layered as defaults, then an optional file, then `WORKFLOW_*`
//! environment variables (`__` separates nested keys, e.g.
//! `WORKFLOW_BUS__FAIRNESS_WINDOW=4`).

use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use workflow_bus::BusConfig;
use workflow_engine::EngineConfig;
use workflow_escalation::OrchestratorConfig;

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,

    #[serde(default = "default_timestamps")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            timestamps: default_timestamps(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> RuntimeResult<Self> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&RuntimeConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Add environment variables
        builder = builder.add_source(
            config::Environment::with_prefix("WORKFLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: RuntimeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot run with
    pub fn validate(&self) -> RuntimeResult<()> {
        self.bus.validate().map_err(RuntimeError::InvalidConfig)?;
        self.engine.validate().map_err(RuntimeError::InvalidConfig)?;
        self.orchestrator
            .validate()
            .map_err(RuntimeError::InvalidConfig)?;
        if self.logging.level.trim().is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "logging.level must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timestamps() -> bool {
    true
}
