//! Log subscriber setup.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Args;

/// Number of rotated log files kept on disk.
const MAX_LOG_FILES: usize = 5;

/// Filter used when `RUST_LOG` is not set.
fn default_filter(level: &str) -> String {
    format!("divert={level},divert_proxy={level},divert_core={level},warn")
}

/// Creates `log_dir` if needed and opens a daily rolling appender in it.
fn file_appender(log_dir: &Path) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .filename_prefix("divert")
        .filename_suffix("log")
        .build(log_dir)
        .context("failed to open log file")
}

/// Initializes logging: console always, plus rotated files with `--log-dir`.
///
/// The returned guard must be kept alive for file output to be flushed.
pub fn init_logging(args: &Args) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(args.effective_log_level())));

    let Some(log_dir) = args.log_dir.as_deref() else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return None;
    };

    match file_appender(log_dir) {
        Ok(appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::info!(log_dir = %log_dir.display(), "logging to directory");
            Some(guard)
        }
        Err(e) => {
            // Fallback: console logging only
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            tracing::warn!(error = %format!("{e:#}"), "file logging unavailable, using console only");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_filter_covers_all_crates() {
        let filter = default_filter("debug");
        assert!(filter.starts_with("divert=debug,"));
        assert!(filter.contains("divert_proxy=debug"));
        assert!(filter.contains("divert_core=debug"));
        assert!(filter.ends_with(",warn"));
        assert!(EnvFilter::try_new(filter).is_ok());
    }

    #[test]
    fn file_appender_creates_missing_directory() {
        let temp = TempDir::new().unwrap();
        let log_dir = temp.path().join("nested").join("logs");

        let appender = file_appender(&log_dir);
        assert!(appender.is_ok());
        assert!(log_dir.is_dir());
    }

    #[test]
    fn file_appender_fails_on_file_path() {
        let temp = TempDir::new().unwrap();
        let not_a_dir = temp.path().join("occupied");
        std::fs::write(&not_a_dir, b"x").unwrap();

        assert!(file_appender(&not_a_dir).is_err());
    }
}
