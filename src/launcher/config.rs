//! Launcher configuration
//!
//! Defaults, overlaid by `BSP_LAUNCHER_*` environment variables, overlaid by
//! command-line options. [`LauncherConfig::validate`] runs once all sources
//! are merged.

use std::env;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::bsp::framing::{DEFAULT_READ_CHUNK_SIZE, MAX_MESSAGE_SIZE};
use crate::io::ServerAddress;
use crate::io::connector::DEFAULT_CONNECT_TIMEOUT;
use crate::launcher::error::{ConfigError, LaunchError};
use crate::launcher::retry::{Backoff, RetryConfig};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Host the server is expected to listen on
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// First port of the range server versions are spread over
pub const DEFAULT_PORT: u16 = 8212;

/// Number of ports, starting at the base port, that versions map onto
pub const DEFAULT_PORT_SPAN: u16 = 1000;

/// File name of the server executable
pub const DEFAULT_SERVER_BINARY: &str = "bsp-server";

/// Arguments passed to the server; `{host}`, `{port}` and `{version}` are substituted
pub const DEFAULT_SERVER_ARGS: &str = "server --host {host} --port {port}";

/// Directory under `$HOME` used when no install root is configured
pub const DEFAULT_INSTALL_DIR_NAME: &str = ".bsp-launcher";

/// Name of the server output log inside the install root
pub const SERVER_LOG_FILE: &str = "server.log";

/// Name of the manifest written into every installed version directory
pub const MANIFEST_FILE: &str = "install.json";

/// Versions must be a single, plain path component
static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._+-]*$").expect("version pattern is valid")
});

// ============================================================================
// Core Configuration Types
// ============================================================================

/// Complete launcher configuration
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Host the server listens on
    pub host: String,

    /// Base port; each version listens on a fixed offset from it
    pub port: u16,

    /// Size of the per-version port range; 1 pins every version to `port`
    pub port_span: u16,

    /// Root directory for installed server versions and the server log
    pub install_root: PathBuf,

    /// File name of the server executable
    pub server_binary: String,

    /// Server argument template
    pub server_args: Vec<String>,

    /// Install command template; `{version}` and `{dest}` are substituted
    pub install_command: Option<Vec<String>>,

    /// Directories searched for a server binary on `PATH`
    pub search_path: Vec<PathBuf>,

    /// Socket polling schedule
    pub retry: RetryConfig,

    /// Bound on a single connection attempt
    pub connect_timeout: Duration,

    /// Bytes requested per read by each relay direction
    pub read_chunk_size: usize,

    /// Largest accepted Content-Length
    pub max_message_size: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            port_span: DEFAULT_PORT_SPAN,
            install_root: default_install_root(),
            server_binary: DEFAULT_SERVER_BINARY.to_string(),
            server_args: split_template(DEFAULT_SERVER_ARGS),
            install_command: None,
            search_path: env::var_os("PATH")
                .map(|path| env::split_paths(&path).collect())
                .unwrap_or_default(),
            retry: RetryConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

fn default_install_root() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_INSTALL_DIR_NAME)
}

/// Split a whitespace separated template into arguments
fn split_template(template: &str) -> Vec<String> {
    template.split_whitespace().map(str::to_string).collect()
}

fn parse_env<T: std::str::FromStr>(variable: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(variable) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid_env(variable, value.clone(), e.to_string())),
        Err(_) => Ok(None),
    }
}

impl LauncherConfig {
    /// Create LauncherConfig from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(host) = env::var("BSP_LAUNCHER_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_env::<u16>("BSP_LAUNCHER_PORT")? {
            config.port = port;
        }
        if let Some(span) = parse_env::<u16>("BSP_LAUNCHER_PORT_SPAN")? {
            config.port_span = span;
        }
        if let Some(home) = env::var_os("BSP_LAUNCHER_HOME") {
            config.install_root = PathBuf::from(home);
        }
        if let Ok(binary) = env::var("BSP_LAUNCHER_SERVER_BINARY") {
            config.server_binary = binary;
        }
        if let Ok(args) = env::var("BSP_LAUNCHER_SERVER_ARGS") {
            config.server_args = split_template(&args);
        }
        if let Ok(command) = env::var("BSP_LAUNCHER_INSTALL_COMMAND") {
            let command = split_template(&command);
            config.install_command = (!command.is_empty()).then_some(command);
        }
        if let Some(attempts) = parse_env::<u32>("BSP_LAUNCHER_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(delay_ms) = parse_env::<u64>("BSP_LAUNCHER_RETRY_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(delay_ms);
            config.retry.max_delay = config.retry.max_delay.max(config.retry.base_delay);
        }
        if let Some(factor) = parse_env::<u32>("BSP_LAUNCHER_RETRY_BACKOFF")? {
            config.retry.backoff = if factor > 1 {
                Backoff::Exponential { factor }
            } else {
                Backoff::Fixed
            };
        }

        if let Some(size) = parse_env::<usize>("BSP_LAUNCHER_READ_CHUNK_SIZE")? {
            config.read_chunk_size = size;
        }
        if let Some(size) = parse_env::<usize>("BSP_LAUNCHER_MAX_MESSAGE_SIZE")? {
            config.max_message_size = size;
        }

        Ok(config)
    }

    /// Override values from CLI arguments
    pub fn with_overrides(
        mut self,
        host: Option<String>,
        port: Option<u16>,
        install_root: Option<PathBuf>,
    ) -> Self {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(install_root) = install_root {
            self.install_root = install_root;
        }
        self
    }

    /// Check merged values for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid_field("host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid_field("port", "must not be 0"));
        }
        if self.port_span == 0 {
            return Err(ConfigError::invalid_field("port span", "must be at least 1"));
        }
        if u32::from(self.port) + u32::from(self.port_span) - 1 > u32::from(u16::MAX) {
            return Err(ConfigError::invalid_field(
                "port span",
                format!("{} ports from {} exceed the port range", self.port_span, self.port),
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::invalid_field("read chunk size", "must not be 0"));
        }
        if self.server_binary.is_empty()
            || self.server_binary.contains(std::path::is_separator)
        {
            return Err(ConfigError::invalid_field(
                "server binary",
                format!("{:?} must be a plain file name", self.server_binary),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid_field(
                "max attempts",
                "at least one connection attempt is required",
            ));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::invalid_field(
                "retry delay",
                format!(
                    "base delay {:?} exceeds max delay {:?}",
                    self.retry.base_delay, self.retry.max_delay
                ),
            ));
        }
        Ok(())
    }

    /// Port associated with `version`
    ///
    /// Stable across runs: the offset into the port range comes from the
    /// SHA-256 of the version string.
    pub fn port_for(&self, version: &str) -> u16 {
        if self.port_span <= 1 {
            return self.port;
        }
        let digest = Sha256::digest(version.as_bytes());
        let offset = u16::from_be_bytes([digest[0], digest[1]]) % self.port_span;
        self.port.saturating_add(offset)
    }

    /// Well-known address of the server for `version`
    pub fn server_address(&self, version: &str) -> ServerAddress {
        ServerAddress::new(self.host.clone(), self.port_for(version))
    }

    /// Deterministic install directory for `version`
    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.install_root.join(version)
    }

    pub fn server_log_path(&self) -> PathBuf {
        self.install_root.join(SERVER_LOG_FILE)
    }

    /// Server arguments with placeholders filled in
    pub fn server_args_for(&self, version: &str) -> Vec<String> {
        let port = self.port_for(version).to_string();
        self.server_args
            .iter()
            .map(|arg| {
                arg.replace("{host}", &self.host)
                    .replace("{port}", &port)
                    .replace("{version}", version)
            })
            .collect()
    }
}

/// Reject versions that are not a plain path component
pub fn validate_version(version: &str) -> Result<(), LaunchError> {
    if VERSION_PATTERN.is_match(version) && !version.contains("..") {
        Ok(())
    } else {
        Err(LaunchError::invalid_version(version))
    }
}

#[cfg(test)]
impl LauncherConfig {
    /// Replace the directories searched for a server binary
    pub fn with_search_path(mut self, search_path: Vec<PathBuf>) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_port_span(mut self, span: u16) -> Self {
        self.port_span = span;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
