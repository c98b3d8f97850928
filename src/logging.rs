//! Tracing subscriber setup: stderr output plus an optional rolling log file.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "jira-conduit.log";

fn filter(config: &LoggingConfig) -> EnvFilter {
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. The returned guard flushes
/// the file writer on drop and must be held for the life of the process.
/// An already-installed subscriber is left in place.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let console = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(true)
    .with_filter(filter(config));

  let (file, guard) = match &config.directory {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_filter(filter(config));
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  if tracing_subscriber::registry()
    .with(console)
    .with(file)
    .try_init()
    .is_err()
  {
    tracing::debug!("global tracing subscriber already set, keeping it");
  }

  Ok(guard)
}
