//! Structured logging initialization.
//!
//! Logging is pure observability: nothing in the fleet branches on it.

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::domain::models::LoggingConfig;

/// Initialize the global tracing subscriber from configuration.
///
/// `RUST_LOG` overrides the configured level. When a log directory is
/// configured, output goes to a daily-rotated file through a non-blocking
/// writer; keep the returned guard alive for the process lifetime.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "aqe.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false);
            if config.format == "json" {
                builder.json().try_init().ok();
            } else {
                builder.try_init().ok();
            }
            Ok(Some(guard))
        }
        None => {
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr);
            if config.format == "json" {
                builder.json().try_init().ok();
            } else {
                builder.try_init().ok();
            }
            Ok(None)
        }
    }
}
