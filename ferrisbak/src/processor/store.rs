//! Backup file persistence.

use std::path::{Path, PathBuf};

use log::debug;
use tokio::fs;

use crate::error::JobError;

/// Writes backups under `root/<device>/<target>.conf`.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the backup for `device` and `target`.
    pub fn path_for(&self, device: &str, target: &str) -> PathBuf {
        self.root.join(device).join(format!("{}.conf", target))
    }

    /// Write `data`, creating parent directories and replacing any
    /// previous backup.
    pub async fn persist(
        &self,
        device: &str,
        target: &str,
        data: &[u8],
    ) -> Result<PathBuf, JobError> {
        let path = self.path_for(device, target);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| JobError::Persist {
                    path: path.clone(),
                    source,
                })?;
        }

        fs::write(&path, data)
            .await
            .map_err(|source| JobError::Persist {
                path: path.clone(),
                source,
            })?;

        debug!("wrote {} bytes to {}", data.len(), path.display());
        Ok(path)
    }
}
