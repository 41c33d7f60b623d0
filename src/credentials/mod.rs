//! Persistence of issued credentials.
//!
//! The certificate is world-readable; the private key is readable by its
//! owner only. Both are written with the exact bytes received.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

/// Result type for credential store operations.
pub type Result<T> = std::result::Result<T, CredentialError>;

/// Errors that can occur while persisting credentials.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set permissions on '{path}': {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Access mode for a persisted credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// `0644`: certificates.
    PublicReadable,
    /// `0600`: private keys.
    OwnerOnly,
}

impl FileMode {
    /// Unix permission bits.
    pub fn bits(self) -> u32 {
        match self {
            FileMode::PublicReadable => 0o644,
            FileMode::OwnerOnly => 0o600,
        }
    }
}

/// Write-bytes-to-named-resource capability.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn write(&self, path: &Path, contents: &[u8], mode: FileMode) -> Result<()>;
}

/// Writes credentials to the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct FileCredentialStore;

impl FileCredentialStore {
    pub fn new() -> Self {
        Self
    }
}

/// Open `path` for writing, empty, with `mode` already applied.
///
/// The creation mode only covers new files, so an existing file is
/// tightened through the open handle before anything is written to it.
async fn open_restricted(path: &Path, mode: FileMode) -> Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(mode.bits());

    let file = options.open(path).await.map_err(|source| CredentialError::Write {
        path: path.to_path_buf(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(mode.bits()))
            .await
            .map_err(|source| CredentialError::Permissions {
                path: path.to_path_buf(),
                source,
            })?;
    }

    Ok(file)
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn write(&self, path: &Path, contents: &[u8], mode: FileMode) -> Result<()> {
        let write_err = |source| CredentialError::Write {
            path: path.to_path_buf(),
            source,
        };

        let mut file = open_restricted(path, mode).await?;
        file.write_all(contents).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;

        debug!(path = %path.display(), bytes = contents.len(), mode = ?mode, "Credential written");
        Ok(())
    }
}

/// In-memory credential store for testing.
#[derive(Default)]
pub struct MemoryCredentialStore {
    files: RwLock<HashMap<PathBuf, (Vec<u8>, FileMode)>>,
    fail_on: RwLock<Option<PathBuf>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail writes to `path`.
    pub async fn set_fail_on(&self, path: impl Into<PathBuf>) {
        *self.fail_on.write().await = Some(path.into());
    }

    pub async fn get(&self, path: impl AsRef<Path>) -> Option<(Vec<u8>, FileMode)> {
        self.files.read().await.get(path.as_ref()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn write(&self, path: &Path, contents: &[u8], mode: FileMode) -> Result<()> {
        if self.fail_on.read().await.as_deref() == Some(path) {
            return Err(CredentialError::Write {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "mock failure"),
            });
        }
        self.files
            .write()
            .await
            .insert(path.to_path_buf(), (contents.to_vec(), mode));
        Ok(())
    }
}
