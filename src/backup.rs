use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::WipeError;

/// Collaborator that keeps a copy of a file before it is destroyed.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Copy `source` into `destination_dir` and return the path of the copy.
    async fn copy(&self, source: &Path, destination_dir: &Path) -> io::Result<PathBuf>;
}

/// Plain copy into a local directory, one uniquely named file per backup.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryBackup;

#[async_trait]
impl BackupStore for DirectoryBackup {
    async fn copy(&self, source: &Path, destination_dir: &Path) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(destination_dir).await?;

        let name = source
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
        let target = destination_dir.join(format!(
            "{}.{}.{}.bak",
            name.to_string_lossy(),
            Utc::now().format("%Y%m%dT%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        ));

        let mut reader = File::open(source).await?;
        let mut writer = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await?;

        // Backups hold the very data being destroyed
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.flush().await?;
        writer.sync_all().await?;
        Ok(target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub source: PathBuf,
    pub backup_path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// Runs before the first destructive pass. Any failure, including a copy
/// whose digest differs from the source, withholds destruction.
#[derive(Clone)]
pub struct BackupInterceptor {
    store: Arc<dyn BackupStore>,
    destination: PathBuf,
}

impl BackupInterceptor {
    pub fn new(store: Arc<dyn BackupStore>, destination: impl Into<PathBuf>) -> Self {
        Self {
            store,
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub async fn protect(&self, source: &Path) -> Result<BackupRecord, WipeError> {
        let backup_path = self
            .store
            .copy(source, &self.destination)
            .await
            .map_err(|e| WipeError::Backup {
                reason: format!("copy into {} failed: {}", self.destination.display(), e),
            })?;

        let (source_digest, bytes) = digest_file(source).await.map_err(|e| WipeError::Backup {
            reason: format!("could not read source for comparison: {}", e),
        })?;
        let (copy_digest, copy_bytes) =
            digest_file(&backup_path).await.map_err(|e| WipeError::Backup {
                reason: format!("could not read backup {}: {}", backup_path.display(), e),
            })?;

        if source_digest != copy_digest || bytes != copy_bytes {
            warn!(
                source = %source.display(),
                backup = %backup_path.display(),
                "backup copy does not match source"
            );
            return Err(WipeError::Backup {
                reason: format!("backup {} does not match the source", backup_path.display()),
            });
        }

        let sha256 = hex::encode(source_digest);
        info!(
            source = %source.display(),
            backup = %backup_path.display(),
            bytes,
            %sha256,
            "backup verified"
        );
        Ok(BackupRecord {
            source: source.to_path_buf(),
            backup_path,
            bytes,
            sha256,
        })
    }
}

async fn digest_file(path: &Path) -> io::Result<([u8; 32], u64)> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    Ok((hasher.finalize().into(), total))
}
