//! Logging setup with a reloadable filter and daily rolling files.
//!
//! This module provides:
//! - Runtime log level changes via `tracing_subscriber::reload`
//! - A separate level for diagram engine reports
//! - Log file retention cleanup (deletes logs older than 7 days)
//! - Local timezone timestamps for logs

use chrono::{Local, NaiveDate};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::diagram::DIAGRAM_LOG_TARGET;
use crate::utils::fs;
use crate::{Error, Result};

/// Prefix of the daily log files (`replay-rig.log.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "replay-rig.log";

/// Log retention period in days.
const LOG_RETENTION_DAYS: i64 = 7;

/// Custom timer that uses the local timezone via chrono.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Build the filter directive for the scheduler and diagram levels.
///
/// Diagram reports never log more verbosely than the scheduler itself.
pub fn filter_directive(log_level: &str, diagram_log_level: &str) -> Result<String> {
    let level = parse_level(log_level)?;
    let diagram_level = parse_level(diagram_log_level)?.min(level);
    let level = level.to_string().to_ascii_lowercase();
    let diagram_level = diagram_level.to_string().to_ascii_lowercase();
    Ok(format!(
        "replay_rig={level},{DIAGRAM_LOG_TARGET}={diagram_level},start_flag={level},tower_http=info"
    ))
}

fn parse_level(raw: &str) -> Result<LevelFilter> {
    let normalized = match raw.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" => "error".to_string(),
        other => other.to_string(),
    };
    normalized
        .parse::<LevelFilter>()
        .map_err(|_| Error::config(format!("Invalid log level '{raw}'")))
}

/// Handle on the installed subscriber.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_dir: PathBuf,
}

impl LoggingConfig {
    /// Get the current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter directive, e.g. `replay_rig=info,replay_rig::diagram=error`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| Error::config(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Start the log retention cleanup task.
    ///
    /// Runs at startup and then daily.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) {
        let log_dir = self.log_dir.clone();

        tokio::spawn(async move {
            let cleanup_interval = Duration::from_secs(24 * 60 * 60);

            loop {
                let today = Local::now().date_naive();
                if let Err(e) = cleanup_old_logs(&log_dir, today, LOG_RETENTION_DAYS).await {
                    warn!(error = %e, "Failed to cleanup old logs");
                }

                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention cleanup task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(cleanup_interval) => {}
                }
            }
        });
    }
}

/// Date of a rolled log file, if `filename` is one.
fn rolled_log_date(filename: &str) -> Option<NaiveDate> {
    let date = filename.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Delete rolled log files older than `retention_days` before `today`.
async fn cleanup_old_logs(
    log_dir: &Path,
    today: NaiveDate,
    retention_days: i64,
) -> std::io::Result<usize> {
    let cutoff = today - chrono::Duration::days(retention_days);

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(file_date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(rolled_log_date)
        else {
            continue;
        };

        if file_date < cutoff {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to delete old log file");
            } else {
                deleted_count += 1;
                debug!(path = %path.display(), "Deleted old log file");
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}

/// Initialize console and daily file logging.
///
/// `RUST_LOG` overrides `directive` when set. Keep the returned guard alive
/// for the lifetime of the process so buffered file output is flushed.
pub fn init_logging(log_dir: &Path, directive: &str) -> Result<(Arc<LoggingConfig>, WorkerGuard)> {
    fs::ensure_dir_all_sync(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    let config = Arc::new(LoggingConfig {
        handle: filter_handle,
        log_dir: log_dir.to_path_buf(),
    });

    Ok((config, guard))
}
