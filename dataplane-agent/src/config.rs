use std::path::PathBuf;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/dataplane-agent/agent.sock";
pub const DEFAULT_LIB_DIR: &str = "/usr/lib/dataplane-agent";
pub const DEFAULT_RUN_DIR: &str = "/var/run/dataplane-agent";

/// Device flag value meaning "no snoop device".
pub const NO_DEVICE: &str = "undefined";

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Panic,
}

impl LogLevel {
    pub fn level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Fatal | LogLevel::Panic => LevelFilter::ERROR,
        }
    }
}

/// Startup settings, built once from the command line and passed by
/// reference to every bootstrap stage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapConfig {
    pub lib_dir: PathBuf,
    pub run_dir: PathBuf,
    pub socket_path: PathBuf,
    pub device: Option<String>,
    pub debug: bool,
}

impl BootstrapConfig {
    pub fn new(
        lib_dir: PathBuf,
        run_dir: PathBuf,
        socket_path: PathBuf,
        device: &str,
        log_level: LogLevel,
    ) -> Self {
        Self {
            lib_dir,
            run_dir,
            socket_path,
            device: parse_device(device),
            debug: log_level == LogLevel::Debug,
        }
    }
}

/// Only the sentinel selects "no device"; anything else, empty or padded
/// values included, is handed to the loader verbatim.
fn parse_device(device: &str) -> Option<String> {
    (device != NO_DEVICE).then(|| device.to_string())
}
