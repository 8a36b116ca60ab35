//! Tracing subscriber setup
//!
//! `RUST_LOG` wins when set; otherwise the level from `LOG_LEVEL` applies to
//! this crate and the HTTP stack, with everything else at `warn`.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn default_directives(level: &str) -> String {
    let level = level.to_lowercase();
    format!(
        "marketplace_settlement={level},settlement_service={level},tower_http={level},sqlx=warn,warn"
    )
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)));

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Plain => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_lowercase_the_level() {
        let directives = default_directives("INFO");
        assert!(directives.starts_with("marketplace_settlement=info"));
        assert!(directives.ends_with(",warn"));
    }

    #[test]
    fn repeated_initialization_is_harmless() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Plain,
        };
        init_tracing(&config);
        init_tracing(&config);
    }
}
