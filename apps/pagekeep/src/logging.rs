//! Subscriber setup for the CLI. Library crates only emit `tracing` events.

use pk_core::CaptureError;
use pk_core::CaptureResult;
use pk_session::LogFormat;
use pk_session::LoggingConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding an `EnvFilter` directive.
pub(crate) const LOG_ENV: &str = "PAGEKEEP_LOG";

/// `PAGEKEEP_LOG` wins over the configured level.
pub(crate) fn build_env_filter(config: &LoggingConfig) -> CaptureResult<EnvFilter> {
    if let Ok(directive) = std::env::var(LOG_ENV) {
        if !directive.trim().is_empty() {
            return EnvFilter::try_new(&directive).map_err(|error| {
                CaptureError::new("app.logging.filter_invalid", format!("{LOG_ENV}: {error}"))
            });
        }
    }
    EnvFilter::try_new(&config.level)
        .map_err(|error| CaptureError::new("app.logging.filter_invalid", format!("level: {error}")))
}

/// Installs the global subscriber. Logs go to stderr; stdout carries the
/// saved file path.
pub(crate) fn init_logging(config: &LoggingConfig) -> CaptureResult<()> {
    let filter = build_env_filter(config)?;
    let registry = Registry::default().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(config.color)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    installed.map_err(|error| CaptureError::new("app.logging.init_failed", error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::build_env_filter;
    use pk_session::LoggingConfig;

    #[test]
    fn configured_level_is_parsed_when_env_is_unset() {
        if std::env::var(super::LOG_ENV).is_ok() {
            return;
        }
        let broken = LoggingConfig {
            level: "pagekeep=[".to_owned(),
            ..LoggingConfig::default()
        };
        let error = build_env_filter(&broken).err();
        assert_eq!(error.map(|error| error.code), Some("app.logging.filter_invalid"));

        let scoped = LoggingConfig {
            level: "info,pagekeep::fetch=debug".to_owned(),
            ..LoggingConfig::default()
        };
        assert!(build_env_filter(&scoped).is_ok());
    }
}
