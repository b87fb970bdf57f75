//! Tracing subscriber setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Build the env filter, falling back to the configured level for this crate
fn build_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("proxy_fleet={}", config.level).into())
}

/// Install the global tracing subscriber
///
/// Returns `false` when a subscriber was already installed.
pub fn init(config: &LogConfig) -> bool {
    let registry = tracing_subscriber::registry().with(build_filter(config));

    let result = if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.is_ok()
}
