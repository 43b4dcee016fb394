//! Install manifest
//!
//! Every installed version directory carries an `install.json` recording
//! which binary was placed there and its SHA-256 digest. The resolver only
//! trusts an install whose binary still matches the manifest.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::launcher::error::InstallError;

/// Record of one installed server version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallManifest {
    /// Version the directory was installed for
    pub version: String,

    /// Server binary, relative to the version directory
    pub binary: PathBuf,

    /// Lowercase hex SHA-256 of the binary
    pub sha256: String,

    pub installed_at: DateTime<Utc>,
}

impl InstallManifest {
    pub async fn load(path: &Path) -> Result<Self, InstallError> {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|e| InstallError::io(path, e))?;
        Ok(serde_json::from_slice(&contents)?)
    }

    pub async fn save(&self, path: &Path) -> Result<(), InstallError> {
        let contents = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| InstallError::io(path, e))
    }
}

/// Compute SHA256 of a file's content
pub async fn sha256_file(path: &Path) -> Result<String, std::io::Error> {
    let content = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}
