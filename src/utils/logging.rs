use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let result = if config.format.eq_ignore_ascii_case("json") {
        fmt().with_env_filter(filter).json().try_init()
    } else {
        fmt().with_env_filter(filter).with_target(true).try_init()
    };

    if let Err(err) = result {
        eprintln!("tracing init failed: {err}");
    }
}
