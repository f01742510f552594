use std::{
    env,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local, SecondsFormat};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogLevel;

const LOG_DIR_NAME: &str = "dataplane-agent-logs";
const LOG_FILE_PREFIX: &str = "dataplane-agent-log-";

/// Installs the global subscriber: stderr plus a per-run log file under the
/// temp directory. The returned guard flushes the file writer when dropped.
///
/// A log file that cannot be created only costs the file sink.
pub fn init(level: LogLevel) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.level_filter().into())
        .from_env_lossy();
    let stderr_layer = fmt::layer().with_writer(io::stderr);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer);

    let log_dir = env::temp_dir().join(LOG_DIR_NAME);
    match create_log_file(&log_dir, Local::now()) {
        Ok((path, file)) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
            registry.with(file_layer).init();
            info!(path = %path.display(), "logging to file");
            Some(guard)
        }
        Err(err) => {
            registry.init();
            warn!(dir = %log_dir.display(), error = %err, "error while creating log file");
            None
        }
    }
}

fn log_file_path(dir: &Path, now: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "{LOG_FILE_PREFIX}{}.log",
        now.to_rfc3339_opts(SecondsFormat::Secs, false)
    ))
}

fn create_log_file(dir: &Path, now: DateTime<Local>) -> io::Result<(PathBuf, File)> {
    fs::create_dir_all(dir)?;
    let path = log_file_path(dir, now);
    let file = File::create(&path)?;
    Ok((path, file))
}
