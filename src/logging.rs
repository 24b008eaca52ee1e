use tracing_subscriber::{
    fmt,
    EnvFilter,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::LoggingConfig;
use crate::error::{PeakError, Result};

/// Builds the filter from `RUST_LOG`, falling back to the configured level
/// for this crate and `warn` for everything else.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,{}={},tower_http=info",
            env!("CARGO_CRATE_NAME"),
            level
        ))
    })
}

/// Sets up the logging subscriber for the application.
pub fn init_logger(config: &LoggingConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(&config.level));

    let result = if config.json {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_level(true)
                    .compact(),
            )
            .try_init()
    };

    result.map_err(|e| PeakError::Internal(format!("Failed to initialize logger: {}", e)))
}
