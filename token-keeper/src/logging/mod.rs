//! Tracing subscriber setup and log file retention.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Default log filter directive, overridden by `RUST_LOG`.
pub const DEFAULT_LOG_FILTER: &str = "token_keeper=info,flow_control=info,sqlx=warn";

/// Prefix of the daily rolling log files.
const LOG_FILE_PREFIX: &str = "token-keeper.log";

/// Log files older than this many days are deleted.
const LOG_RETENTION_DAYS: i64 = 7;

/// RFC 3339 timestamps in UTC with millisecond precision.
#[derive(Debug, Clone, Copy)]
struct UtcTimer;

impl FormatTime for UtcTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }
}

/// Output options for [`init_logging`].
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Emit JSON lines on the console instead of human-readable text.
    pub json: bool,
    /// Also write to a daily rolling file in this directory.
    pub log_dir: Option<PathBuf>,
}

/// Install the global subscriber.
///
/// Returns the file writer guard when file output is enabled; keep it alive
/// for the lifetime of the process or buffered lines are lost.
pub fn init_logging(options: &LogOptions) -> crate::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if options.json {
        layers.push(fmt::layer().json().with_timer(UtcTimer).boxed());
    } else {
        layers.push(fmt::layer().with_ansi(true).with_timer(UtcTimer).boxed());
    }

    let guard = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            layers.push(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_timer(UtcTimer)
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
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    Ok(guard)
}

/// Delete rolled log files older than the retention period once a day.
pub fn start_retention_cleanup(log_dir: PathBuf, cancel_token: CancellationToken) {
    tokio::spawn(async move {
        let cleanup_interval = Duration::from_secs(24 * 60 * 60);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Log retention cleanup task shutting down");
                    break;
                }
                _ = tokio::time::sleep(cleanup_interval) => {
                    if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                        warn!(error = %e, "Failed to cleanup old logs");
                    }
                }
            }
        }
    });
}

/// Delete `token-keeper.log.YYYY-MM-DD` files older than `retention_days`.
async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(date_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(LOG_FILE_PREFIX))
            .and_then(|n| n.strip_prefix('.'))
        else {
            continue;
        };

        if let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
            && file_date < cutoff
        {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted_count += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}
