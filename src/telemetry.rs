use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::LoggingSection;

const LOG_FILE_PREFIX: &str = "stockflow.log";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `logging.level`. Output goes to stderr, as JSON when
/// `logging.json` is set, and additionally as JSON to a daily-rolling file
/// under `logging.dir`. Keep the returned guard alive until exit so the file
/// writer flushes.
pub fn init_tracing(logging: &LoggingSection) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(std::env::var("RUST_LOG").ok(), &logging.level)?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(true);
    if logging.json {
        layers.push(stderr.json().boxed());
    } else {
        layers.push(stderr.boxed());
    }

    let guard = match &logging.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

fn env_filter(rust_log: Option<String>, level: &str) -> Result<EnvFilter> {
    match rust_log.filter(|v| !v.trim().is_empty()) {
        Some(directives) => EnvFilter::try_new(&directives)
            .with_context(|| format!("Invalid RUST_LOG '{}'", directives)),
        None => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid logging.level '{}'", level)),
    }
}
