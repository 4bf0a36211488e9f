//! Optional file logging next to the stderr subscriber.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;

/// Create a non-blocking writer for `{log_dir}/rotor-{timestamp}.log`.
///
/// The returned guard flushes on drop and must outlive the subscriber.
pub fn create_log_writer(
    log_dir: &Path,
) -> Result<(
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
)> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log dir {}", log_dir.display()))?;

    let file_name = format!("rotor-{}.log", Utc::now().format("%Y%m%d-%H%M%S"));
    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    Ok(tracing_appender::non_blocking(file_appender))
}
