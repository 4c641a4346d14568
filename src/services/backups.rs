use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::errors::{RecoveryError, Result};

pub const BACKUP_DIR_NAME: &str = ".backups";
pub const VERSION_FILE_NAME: &str = "version.txt";

pub fn backup_dir(install_dir: &Path) -> PathBuf {
    install_dir.join(BACKUP_DIR_NAME)
}

/// Copies `file_name` out of the install dir into the backup dir before
/// it gets overwritten. Returns false when there is nothing to stash.
pub async fn stash_existing(install_dir: &Path, file_name: &str) -> Result<bool> {
    let source = install_dir.join(file_name);
    if !source.is_file() {
        return Ok(false);
    }
    let dir = backup_dir(install_dir);
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::copy(&source, dir.join(file_name)).await?;
    Ok(true)
}

pub async fn write_version_stamp(install_dir: &Path) -> Result<()> {
    let dir = backup_dir(install_dir);
    tokio::fs::create_dir_all(&dir).await?;
    let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    tokio::fs::write(dir.join(VERSION_FILE_NAME), stamp).await?;
    Ok(())
}

/// Timestamp of the last backup, or None when no stamp was ever written.
pub async fn backup_info(install_dir: &Path) -> Result<Option<String>> {
    let stamp_path = backup_dir(install_dir).join(VERSION_FILE_NAME);
    match tokio::fs::read_to_string(&stamp_path).await {
        Ok(raw) => {
            let trimmed = raw.trim().to_string();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed))
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Copies every backed up file back into the install dir and returns
/// how many were restored. The version stamp itself stays behind.
pub async fn restore_backup(install_dir: &Path) -> Result<usize> {
    let dir = backup_dir(install_dir);
    if !dir.is_dir() {
        return Err(RecoveryError::NotFound(format!(
            "backup at {}",
            dir.display()
        )));
    }
    let mut restored = 0usize;
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        if file_name.to_string_lossy() == VERSION_FILE_NAME {
            continue;
        }
        if !entry.file_type().await?.is_file() {
            continue;
        }
        tokio::fs::copy(entry.path(), install_dir.join(&file_name)).await?;
        tracing::info!("restored {}", file_name.to_string_lossy());
        restored += 1;
    }
    Ok(restored)
}

pub async fn delete_backup(install_dir: &Path) -> Result<()> {
    let dir = backup_dir(install_dir);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
