//! Tracing initialisation

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Returns `false` when a
/// subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    let result = match (config.json, config.timestamps) {
        (true, true) => subscriber
            .with(fmt::layer().json().with_target(true))
            .try_init(),
        (true, false) => subscriber
            .with(fmt::layer().json().with_target(true).without_time())
            .try_init(),
        (false, true) => subscriber.with(fmt::layer().with_target(true)).try_init(),
        (false, false) => subscriber
            .with(fmt::layer().with_target(true).without_time())
            .try_init(),
    };
    result.is_ok()
}
