//! Logging setup
//!
//! Logs go to stderr or to a file, never to stdout: stdout carries the
//! protocol stream to the BSP client.

use std::env;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "info", "bsp_launcher=trace")
    pub level: String,
    /// Optional log file path. If None, logs only to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

/// Insert the process ID before the extension: `launcher.log` -> `launcher.<pid>.log`
fn unique_log_path(mut path: PathBuf, pid: u32) -> PathBuf {
    if let Some(stem) = path.file_stem() {
        let unique = match path.extension().and_then(|ext| ext.to_str()) {
            Some(extension) if !extension.is_empty() => {
                format!("{}.{}.{}", stem.to_string_lossy(), pid, extension)
            }
            _ => format!("{}.{}", stem.to_string_lossy(), pid),
        };
        path.set_file_name(unique);
    }
    path
}

impl LogConfig {
    /// Create LogConfig from environment variables
    ///
    /// `RUST_LOG`, `BSP_LAUNCHER_LOG_FILE`, `BSP_LAUNCHER_LOG_JSON` and
    /// `BSP_LAUNCHER_LOG_UNIQUE` (one file per launcher process).
    pub fn from_env() -> Self {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let unique = env::var("BSP_LAUNCHER_LOG_UNIQUE").unwrap_or_default() == "true";
        let file_path = env::var_os("BSP_LAUNCHER_LOG_FILE").map(|path| {
            let path = PathBuf::from(path);
            if unique {
                unique_log_path(path, std::process::id())
            } else {
                path
            }
        });

        let json_format = env::var("BSP_LAUNCHER_LOG_JSON").unwrap_or_default() == "true";

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;
    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file_layer = fmt::layer()
                .json()
                .with_writer(open_log_file(file_path)?)
                .with_ansi(false);
            subscriber.with(file_layer).try_init()?;
        }
        (Some(file_path), false) => {
            let file_layer = fmt::layer()
                .with_writer(open_log_file(file_path)?)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);
            subscriber.with(file_layer).try_init()?;
        }
        (None, true) => {
            let stderr_layer = fmt::layer().json().with_writer(io::stderr).with_ansi(false);
            subscriber.with(stderr_layer).try_init()?;
        }
        (None, false) => {
            let stderr_layer = fmt::layer()
                .with_writer(io::stderr)
                .with_target(true)
                .with_thread_ids(true);
            subscriber.with(stderr_layer).try_init()?;
        }
    }

    Ok(())
}

/// Log one relayed BSP frame in a single structured line
#[macro_export]
macro_rules! log_bsp_frame {
    ($level:expr, $direction:expr, $message:expr) => {
        tracing::event!(
            $level,
            direction = %$direction,
            content_length = $message.payload().len(),
            headers = $message.headers().len(),
            "BSP frame"
        );
    };
}

/// Helper function to log performance timing
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}
