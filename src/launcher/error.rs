//! Error types for server launching
//!
//! One enum per concern, aggregated into [`LaunchError`] for the caller.

use std::path::PathBuf;
use std::process::ExitStatus;

use crate::bsp::ForwardError;
use crate::io::ServerAddress;
use crate::io::process::ProcessError;

// ============================================================================
// Launch Errors
// ============================================================================

/// Everything that can stop a BSP session from being established or run
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Requested version cannot be used as an install location
    #[error("Invalid server version: {version:?}")]
    InvalidVersion { version: String },

    /// Fetching or placing server artifacts failed
    #[error("Installation failed: {0}")]
    Installation(#[from] InstallError),

    /// Spawning or inspecting the server process failed
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// The server process exited before accepting connections
    #[error("Server exited before accepting connections on {address} ({status})")]
    ServerExited {
        address: ServerAddress,
        status: ExitStatus,
    },

    /// The server socket never opened within the retry bound
    #[error("Server on {address} not reachable after {attempts} attempts: {last_error}")]
    StartupTimeout {
        address: ServerAddress,
        attempts: u32,
        last_error: String,
    },

    /// The relay session failed
    #[error("Session error: {0}")]
    Session(#[from] ForwardError),
}

impl LaunchError {
    pub fn invalid_version(version: impl Into<String>) -> Self {
        Self::InvalidVersion {
            version: version.into(),
        }
    }

    pub fn startup_timeout(
        address: ServerAddress,
        attempts: u32,
        last_error: impl Into<String>,
    ) -> Self {
        Self::StartupTimeout {
            address,
            attempts,
            last_error: last_error.into(),
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration parsing and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable present but unusable
    #[error("Invalid value for {variable}: {value:?} - {reason}")]
    InvalidEnv {
        variable: String,
        value: String,
        reason: String,
    },

    /// Invalid field value after all sources were merged
    #[error("Invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid_env(
        variable: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidEnv {
            variable: variable.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Installation Errors
// ============================================================================

/// Artifact fetch and placement errors
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// No way to obtain artifacts was configured
    #[error("No install command configured (set BSP_LAUNCHER_INSTALL_COMMAND)")]
    NoFetcher,

    /// The fetch collaborator failed
    #[error("Fetching server {version} failed: {reason}")]
    FetchFailed { version: String, reason: String },

    /// The fetched artifacts do not contain the server binary
    #[error("Server binary {binary:?} not found in {dir}")]
    BinaryNotFound { binary: String, dir: PathBuf },

    /// Filesystem operation on the install tree failed
    #[error("Install I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest could not be written
    #[error("Install manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    /// Installation finished but the result does not resolve as installed
    #[error("Server {version} still not resolvable after installation")]
    NotResolvable { version: String },
}

impl InstallError {
    pub fn fetch_failed(version: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FetchFailed {
            version: version.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation_helpers() {
        let timeout = LaunchError::startup_timeout(ServerAddress::new("127.0.0.1", 8212), 5, "refused");
        assert!(matches!(
            timeout,
            LaunchError::StartupTimeout { attempts: 5, .. }
        ));
        assert!(timeout.to_string().contains("127.0.0.1:8212"));

        let config_error = ConfigError::invalid_field("port", "must not be 0");
        assert_eq!(config_error.to_string(), "Invalid port: must not be 0");
    }

    #[test]
    fn test_error_conversion() {
        let install_error = InstallError::fetch_failed("1.0.0", "exit status 1");
        let launch_error: LaunchError = install_error.into();
        assert!(matches!(launch_error, LaunchError::Installation(_)));

        let config_error = ConfigError::invalid_env("BSP_LAUNCHER_PORT", "x", "not a number");
        let launch_error: LaunchError = config_error.into();
        assert!(matches!(launch_error, LaunchError::Config(_)));
    }
}
