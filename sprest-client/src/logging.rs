//! Subscriber setup for applications and tests built on the client.
//!
//! The client only emits `tracing` events; nothing is printed until one of
//! these (or the application's own subscriber) is installed.

use anyhow::Context;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt::time::ChronoUtc, prelude::*, EnvFilter};

/// Batch lifecycle, retries and cache hits at debug; dependencies quieter.
pub const DEFAULT_FILTER: &str = "sprest_client=debug,sprest_transport=debug,sprest_core=info,reqwest=info,hyper=warn,warn";

/// `RUST_LOG` when set and valid, `default` otherwise.
fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Human-readable events on stderr plus JSON lines in a daily-rolling file
/// under `log_dir`.
///
/// File output is written by a background worker; keep the returned guard
/// alive for as long as events should reach the file.
pub fn init_logging(log_dir: impl AsRef<Path>, file_prefix: &str) -> anyhow::Result<WorkerGuard> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_prefix)
        .filename_suffix("jsonl")
        .build(log_dir)
        .context("building rolling log appender")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let console = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(std::io::stderr);

    let file = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(filter_or(DEFAULT_FILTER))
        .with(console)
        .with(file)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    tracing::debug!(dir = %log_dir.display(), prefix = file_prefix, "Logging initialized");
    Ok(guard)
}

/// Console logging captured by the test harness. Later calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or("sprest_client=trace,sprest_transport=trace,info"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn test_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::debug!("still fine");
    }
}
