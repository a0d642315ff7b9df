use anyhow::{Context, Result};
use pricewatch_core::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_FILE: &str = "pricewatch.log";
const DEFAULT_LEVEL: &str = "info";

/// Install the global subscriber.
///
/// With a log config, events go to a daily-rolling file in its directory;
/// `verbose` adds stderr. `RUST_LOG` overrides the configured level. Keep the
/// returned guard alive until exit or buffered lines are lost.
pub fn init(config: Option<&LogConfig>, verbose: bool) -> Result<Option<WorkerGuard>> {
    let level = config.map_or(DEFAULT_LEVEL, |config| config.level.as_str());
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level '{}'", level))?,
    };

    let (file_layer, guard) = match config {
        Some(config) => {
            std::fs::create_dir_all(&config.dir)
                .with_context(|| format!("Failed to create log directory {:?}", config.dir))?;
            let appender = tracing_appender::rolling::daily(&config.dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let stderr_layer = verbose.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("Failed to install logger")?;
    Ok(guard)
}
