//! Session logging: rotating timestamped files plus a `latest.log` symlink
//! under the per-user state directory. The console layer only surfaces
//! warnings so the interactive stream stays clean.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Initialize tracing for an interactive session. Returns the log file
/// path so the session can mention it on internal errors.
///
/// `PATCHUP_LOG` overrides the default `debug` file filter.
pub fn init_session_logging() -> Result<PathBuf> {
    let logs_dir = super::config::state_dir()?.join("logs");
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("Failed to create log dir {}", logs_dir.display()))?;

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let log_path = logs_dir.join(format!("patchup_{timestamp}.log"));
    let file = File::create(&log_path)
        .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

    refresh_latest_symlink(&logs_dir, &log_path);

    let filter = EnvFilter::try_from_env("PATCHUP_LOG").unwrap_or_else(|_| EnvFilter::new("debug"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Arc::new(file).and(std::io::stderr.with_max_level(tracing::Level::WARN)))
        .finish();

    // A second init (tests, repeated sessions in-process) is not an error
    let _ = tracing::subscriber::set_global_default(subscriber);

    Ok(log_path)
}

/// Point `latest.log` at the newest session log. Best-effort: a filesystem
/// without symlink support just goes without.
fn refresh_latest_symlink(logs_dir: &std::path::Path, log_path: &std::path::Path) {
    let latest = logs_dir.join("latest.log");
    let _ = std::fs::remove_file(&latest);
    #[cfg(unix)]
    let _ = std::os::unix::fs::symlink(log_path, &latest);
    #[cfg(windows)]
    let _ = std::os::windows::fs::symlink_file(log_path, &latest);
}
