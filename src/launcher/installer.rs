//! Server installation
//!
//! Obtains server artifacts through an [`ArtifactFetcher`], places them in a
//! staging directory, records an [`InstallManifest`] and moves the result
//! into the deterministic version directory in a single rename. The install
//! is only considered done once the resolver accepts it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::launcher::config::{LauncherConfig, MANIFEST_FILE};
use crate::launcher::error::InstallError;
use crate::launcher::manifest::{InstallManifest, sha256_file};
use crate::launcher::resolver::ServerResolver;

/// Obtains the artifacts of one server version
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Place the artifacts for `version` somewhere below `dest`
    async fn fetch(&self, version: &str, dest: &Path) -> Result<(), InstallError>;
}

/// Fetcher running an external install command
///
/// `{version}` and `{dest}` are substituted in every argument. The command's
/// output is captured so it never reaches the launcher's stdout.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    command: Vec<String>,
}

impl CommandFetcher {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl ArtifactFetcher for CommandFetcher {
    async fn fetch(&self, version: &str, dest: &Path) -> Result<(), InstallError> {
        let (program, args) = self.command.split_first().ok_or(InstallError::NoFetcher)?;

        let dest = dest.to_string_lossy();
        let substitute = |arg: &str| arg.replace("{version}", version).replace("{dest}", &dest);
        let args: Vec<String> = args.iter().map(|arg| substitute(arg)).collect();

        info!("Running install command: {} {:?}", program, args);
        let output = Command::new(substitute(program))
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| InstallError::fetch_failed(version, format!("cannot run {program}: {e}")))?;

        debug!(
            "Install command output: {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );

        if !output.status.success() {
            return Err(InstallError::fetch_failed(
                version,
                format!(
                    "{program} exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}

/// Installs server versions under the configured install root
pub struct Installer {
    config: Arc<LauncherConfig>,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
}

impl Installer {
    pub fn new(config: Arc<LauncherConfig>, fetcher: Option<Arc<dyn ArtifactFetcher>>) -> Self {
        Self { config, fetcher }
    }

    /// Installer using the configured install command, if any
    pub fn from_config(config: Arc<LauncherConfig>) -> Self {
        let fetcher = config
            .install_command
            .clone()
            .map(|command| Arc::new(CommandFetcher::new(command)) as Arc<dyn ArtifactFetcher>);
        Self::new(config, fetcher)
    }

    /// Install `version` and return the verified server binary
    pub async fn install(
        &self,
        version: &str,
        resolver: &ServerResolver,
    ) -> Result<PathBuf, InstallError> {
        let fetcher = self.fetcher.as_ref().ok_or(InstallError::NoFetcher)?;

        let root = &self.config.install_root;
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| InstallError::io(root, e))?;

        let staging = root.join(format!(".staging-{}", Uuid::new_v4()));
        tokio::fs::create_dir(&staging)
            .await
            .map_err(|e| InstallError::io(&staging, e))?;

        info!("Installing server {} into {}", version, staging.display());
        let staged = self.stage(fetcher.as_ref(), version, &staging).await;
        if let Err(e) = staged {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await {
                warn!("Failed to remove {}: {}", staging.display(), cleanup);
            }
            return Err(e);
        }

        self.promote(version, &staging, resolver).await?;

        resolver
            .installed_binary(version)
            .await
            .ok_or_else(|| InstallError::NotResolvable {
                version: version.to_string(),
            })
    }

    /// Fetch into `staging`, prepare the binary and write the manifest
    async fn stage(
        &self,
        fetcher: &dyn ArtifactFetcher,
        version: &str,
        staging: &Path,
    ) -> Result<(), InstallError> {
        fetcher.fetch(version, staging).await?;

        let binary = find_binary(staging, &self.config.server_binary).ok_or_else(|| {
            InstallError::BinaryNotFound {
                binary: self.config.server_binary.clone(),
                dir: staging.to_path_buf(),
            }
        })?;
        make_executable(&binary).await?;

        let manifest = InstallManifest {
            version: version.to_string(),
            binary: binary
                .strip_prefix(staging)
                .unwrap_or(&binary)
                .to_path_buf(),
            sha256: sha256_file(&binary)
                .await
                .map_err(|e| InstallError::io(&binary, e))?,
            installed_at: Utc::now(),
        };
        debug!("Writing install manifest: {:?}", manifest);
        manifest.save(&staging.join(MANIFEST_FILE)).await
    }

    /// Move a staged install into its version directory
    async fn promote(
        &self,
        version: &str,
        staging: &Path,
        resolver: &ServerResolver,
    ) -> Result<(), InstallError> {
        let target = self.config.version_dir(version);

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            warn!("Replacing unverified install at {}", target.display());
            tokio::fs::remove_dir_all(&target)
                .await
                .map_err(|e| InstallError::io(&target, e))?;
        }

        match tokio::fs::rename(staging, &target).await {
            Ok(()) => {
                info!("Installed server {} at {}", version, target.display());
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(staging).await {
                    warn!("Failed to remove {}: {}", staging.display(), cleanup);
                }
                // A concurrent launcher may have completed the same install
                if resolver.installed_binary(version).await.is_some() {
                    debug!("Server {} was installed concurrently", version);
                    Ok(())
                } else {
                    Err(InstallError::io(&target, e))
                }
            }
        }
    }
}

/// Shallowest file named `binary` below `dir`
fn find_binary(dir: &Path, binary: &str) -> Option<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == binary)
        .min_by_key(|e| e.depth())
        .map(|e| e.into_path())
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| InstallError::io(path, e))?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    tokio::fs::set_permissions(path, permissions)
        .await
        .map_err(|e| InstallError::io(path, e))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<(), InstallError> {
    Ok(())
}
