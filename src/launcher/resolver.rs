//! Server state resolution
//!
//! Answers where, if anywhere, a server for a requested version can be
//! reached. Checks in priority order:
//!
//! 1. a server already listening on the address associated with the version
//! 2. a verified install under the install root
//! 3. the server binary on `PATH`
//!
//! Resolution is a pure query: nothing is installed or started here.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::io::{Connector, ServerAddress};
use crate::launcher::config::{LauncherConfig, MANIFEST_FILE};
use crate::launcher::manifest::{InstallManifest, sha256_file};

/// Where a reachable server lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLocation {
    /// A server already accepts connections here
    RunningSocket(ServerAddress),
    /// A runnable server binary found on `PATH`
    RunningBinary(PathBuf),
    /// A binary installed by this launcher for the requested version
    InstalledBinary(PathBuf),
}

/// Outcome of resolving a server version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    NotFound,
    AvailableAt(ServerLocation),
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerLocation::RunningSocket(address) => write!(f, "running server at {address}"),
            ServerLocation::RunningBinary(path) => write!(f, "server binary {}", path.display()),
            ServerLocation::InstalledBinary(path) => {
                write!(f, "installed server {}", path.display())
            }
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::NotFound => write!(f, "not found"),
            ServerState::AvailableAt(location) => write!(f, "{location}"),
        }
    }
}

/// Resolves [`ServerState`] for a version
pub struct ServerResolver {
    config: Arc<LauncherConfig>,
    connector: Arc<dyn Connector>,
}

impl ServerResolver {
    pub fn new(config: Arc<LauncherConfig>, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    /// Determine where a server for `version` can be reached
    pub async fn resolve(&self, version: &str) -> ServerState {
        let address = self.config.server_address(version);
        match self.connector.connect(&address).await {
            Ok(_stream) => {
                info!("Found server {} already listening on {}", version, address);
                return ServerState::AvailableAt(ServerLocation::RunningSocket(address));
            }
            Err(e) => debug!("No server listening on {}: {}", address, e),
        }

        if let Some(binary) = self.installed_binary(version).await {
            info!("Found installed server {} at {}", version, binary.display());
            return ServerState::AvailableAt(ServerLocation::InstalledBinary(binary));
        }

        if let Some(binary) = self.binary_on_path() {
            info!("Found server binary on PATH: {}", binary.display());
            return ServerState::AvailableAt(ServerLocation::RunningBinary(binary));
        }

        debug!("No server found for version {}", version);
        ServerState::NotFound
    }

    /// Installed binary for `version`, if its manifest checks out
    pub async fn installed_binary(&self, version: &str) -> Option<PathBuf> {
        let dir = self.config.version_dir(version);
        let manifest = match InstallManifest::load(&dir.join(MANIFEST_FILE)).await {
            Ok(manifest) => manifest,
            Err(e) => {
                debug!("No usable install manifest in {}: {}", dir.display(), e);
                return None;
            }
        };

        if manifest.version != version {
            warn!(
                "Install manifest in {} is for version {}, expected {}",
                dir.display(),
                manifest.version,
                version
            );
            return None;
        }

        let binary = dir.join(&manifest.binary);
        match sha256_file(&binary).await {
            Ok(digest) if digest == manifest.sha256 => Some(binary),
            Ok(_) => {
                warn!(
                    "Installed binary {} does not match its manifest digest",
                    binary.display()
                );
                None
            }
            Err(e) => {
                warn!("Cannot read installed binary {}: {}", binary.display(), e);
                None
            }
        }
    }

    /// First executable named like the server binary on the search path
    pub fn binary_on_path(&self) -> Option<PathBuf> {
        self.config
            .search_path
            .iter()
            .map(|dir| dir.join(&self.config.server_binary))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
pub(crate) fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub(crate) fn is_executable(path: &Path) -> bool {
    path.is_file()
}
