//! Global tracing subscriber setup.

use crate::config::LoggingConfig;
use crate::errors::ConfigError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, for terminals and CI consoles.
    Pretty,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::invalid(
                "logging.format",
                format!("unknown format '{other}', expected 'json' or 'pretty'"),
            )),
        }
    }
}

/// Builds the filter. `RUST_LOG` takes precedence over `level`.
#[must_use]
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber.
///
/// Must be called once, before the first event. Step output is logged
/// under the `ciflow::step` target.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ConfigError> {
    let format: LogFormat = config.format.parse()?;
    let filter = env_filter(&config.level);

    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };
    result.map_err(|e| ConfigError::invalid("logging", format!("failed to initialize tracing: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_unknown_format_is_rejected_before_install() {
        let config = LoggingConfig {
            level: "info".into(),
            format: "text".into(),
        };
        assert!(init_tracing(&config).is_err());
    }
}
