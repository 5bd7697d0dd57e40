//! Module backups.
//!
//! A backup is a full copy of a module's installed directory taken right
//! before an update touches it. Each backup carries metadata and a digest
//! of its content listing, checked again before the backup is restored.
//!
//! # Backup Directory Structure
//!
//! ```text
//! backup_dir/
//! └── blog/
//!     ├── backup-1.0.0-1704067200000/
//!     │   ├── files/              # Copy of the module directory
//!     │   └── metadata.json       # Module, version, time, size, digest
//!     └── backup-1.1.0-1704153600000/
//!         ├── files/
//!         └── metadata.json
//! ```

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use modhost_core::{Module, ModuleVersion};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::checksum;
use crate::error::UpdateError;

/// Metadata file name within backup directories.
const METADATA_FILE: &str = "metadata.json";
/// Directory holding the copied module files.
const FILES_DIR: &str = "files";

/// Information about a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub module: String,
    /// Version that was backed up
    pub version: ModuleVersion,
    pub created_at: DateTime<Utc>,
    /// Path to the backup directory
    pub path: PathBuf,
    /// Total size of the copied files in bytes
    pub size: u64,
    /// SHA-256 over the sorted listing of relative paths and file hashes
    pub digest: String,
}

impl BackupInfo {
    pub fn files_path(&self) -> PathBuf {
        self.path.join(FILES_DIR)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path.join(METADATA_FILE)
    }
}

/// Creates, restores and prunes module backups.
///
/// Cloning is cheap and clones share the set of pinned backups.
#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_dir: PathBuf,
    max_backups: usize,
    pinned: Arc<Mutex<HashSet<PathBuf>>>,
}

impl BackupManager {
    /// Create a new backup manager.
    ///
    /// # Arguments
    ///
    /// * `backup_dir` - Directory where backups will be stored
    /// * `max_backups` - Backups retained per module by `cleanup_old_backups`
    pub fn new(backup_dir: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            max_backups,
            pinned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn max_backups(&self) -> usize {
        self.max_backups
    }

    fn module_dir(&self, module: &str) -> PathBuf {
        self.backup_dir.join(module)
    }

    fn pinned(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.pinned.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot the installed files of `module`.
    ///
    /// # Errors
    ///
    /// `BackupFailed` if the module directory is missing or cannot be
    /// copied. A partially written backup is removed.
    pub fn create_backup(&self, module: &Module) -> Result<BackupInfo, UpdateError> {
        self.create_pinned_backup(module).map(|(info, _pin)| info)
    }

    /// Like [`BackupManager::create_backup`], but the new backup is pinned
    /// before it becomes visible to cleanup and stays pinned while the
    /// returned guard lives.
    pub fn create_pinned_backup(&self, module: &Module) -> Result<(BackupInfo, BackupPin), UpdateError> {
        let failed = |reason: String| UpdateError::BackupFailed {
            module: module.name.clone(),
            reason,
        };

        if !module.path.is_dir() {
            return Err(failed(format!(
                "module directory {} does not exist",
                module.path.display()
            )));
        }

        let module_dir = self.module_dir(&module.name);
        fs::create_dir_all(&module_dir).map_err(|e| failed(e.to_string()))?;

        let now = Utc::now();
        let backup_path = unique_dir(
            &module_dir,
            &format!("backup-{}-{}", module.version, now.timestamp_millis()),
        );
        let pin = self.pin(&backup_path);
        info!(
            module = %module.name,
            version = %module.version,
            path = %backup_path.display(),
            "Creating backup"
        );

        let result = (|| -> Result<BackupInfo, UpdateError> {
            let files = backup_path.join(FILES_DIR);
            fs::create_dir_all(&files)?;
            copy_dir_recursive(&module.path, &files)?;
            let (digest, size) = content_digest(&files)?;

            let info = BackupInfo {
                module: module.name.clone(),
                version: module.version.clone(),
                created_at: now,
                path: backup_path.clone(),
                size,
                digest,
            };
            fs::write(info.metadata_path(), serde_json::to_string_pretty(&info)?)?;
            Ok(info)
        })();

        match result {
            Ok(info) => {
                debug!(size = info.size, digest = %info.digest, "Backup created");
                Ok((info, pin))
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&backup_path);
                Err(failed(e.to_string()))
            }
        }
    }

    /// Read and integrity-check the backup at `path`.
    ///
    /// # Errors
    /// * `BackupNotFound` if there is no backup at `path`
    /// * `BackupCorrupted` if its metadata is unreadable or its content
    ///   no longer matches the recorded digest
    pub fn verify_backup(&self, path: &Path) -> Result<BackupInfo, UpdateError> {
        let metadata_path = path.join(METADATA_FILE);
        if !metadata_path.is_file() {
            return Err(UpdateError::BackupNotFound {
                path: path.to_path_buf(),
            });
        }
        let corrupted = |reason: String| UpdateError::BackupCorrupted {
            path: path.to_path_buf(),
            reason,
        };

        let content = fs::read_to_string(&metadata_path)?;
        let mut info: BackupInfo =
            serde_json::from_str(&content).map_err(|e| corrupted(format!("metadata: {e}")))?;
        info.path = path.to_path_buf();

        let files = info.files_path();
        if !files.is_dir() {
            return Err(corrupted("files directory is missing".to_string()));
        }
        let (digest, size) = content_digest(&files)?;
        if digest != info.digest || size != info.size {
            warn!(
                path = %path.display(),
                expected = %info.digest,
                actual = %digest,
                "Backup integrity verification failed"
            );
            return Err(corrupted("content digest does not match".to_string()));
        }
        Ok(info)
    }

    /// Replace the installed files of `module` with the backup at `path`.
    ///
    /// Restoring the same backup twice leaves the same files in place. The
    /// module directory is swapped in whole, so a failed restore leaves the
    /// previous contents untouched.
    pub fn restore_backup(&self, module: &Module, path: &Path) -> Result<BackupInfo, UpdateError> {
        let info = self.verify_backup(path)?;
        if info.module != module.name {
            return Err(UpdateError::BackupCorrupted {
                path: path.to_path_buf(),
                reason: format!("backup belongs to {}, not {}", info.module, module.name),
            });
        }

        info!(
            module = %module.name,
            version = %info.version,
            path = %path.display(),
            "Restoring backup"
        );

        let target = &module.path;
        let staging = sibling(target, "restore-tmp");
        let previous = sibling(target, "restore-old");
        remove_if_exists(&staging)?;
        remove_if_exists(&previous)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&staging)?;
        if let Err(e) = copy_dir_recursive(&info.files_path(), &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }

        let had_previous = target.exists();
        if had_previous {
            fs::rename(target, &previous)?;
        }
        if let Err(e) = fs::rename(&staging, target) {
            if had_previous {
                let _ = fs::rename(&previous, target);
            }
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        if had_previous {
            if let Err(e) = fs::remove_dir_all(&previous) {
                warn!(path = %previous.display(), error = %e, "Failed to remove replaced files");
            }
        }

        info!(module = %module.name, version = %info.version, "Backup restored");
        Ok(info)
    }

    /// Backups of `module`, newest first.
    ///
    /// Directories with unreadable metadata are skipped with a warning.
    pub fn list_backups(&self, module: &str) -> Result<Vec<BackupInfo>, UpdateError> {
        let dir = self.module_dir(module);
        let mut backups = Vec::new();
        if !dir.exists() {
            return Ok(backups);
        }

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let metadata_path = path.join(METADATA_FILE);
            if !metadata_path.exists() {
                debug!("Skipping directory without metadata: {:?}", path);
                continue;
            }

            match fs::read_to_string(&metadata_path) {
                Ok(content) => match serde_json::from_str::<BackupInfo>(&content) {
                    Ok(mut info) => {
                        info.path = path;
                        backups.push(info);
                    }
                    Err(e) => {
                        warn!("Failed to parse backup metadata at {:?}: {}", metadata_path, e);
                    }
                },
                Err(e) => {
                    warn!("Failed to read backup metadata at {:?}: {}", metadata_path, e);
                }
            }
        }

        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.path.cmp(&a.path))
        });
        Ok(backups)
    }

    /// Total bytes held by the backups of `module`.
    pub fn backup_size(&self, module: &str) -> Result<u64, UpdateError> {
        Ok(self.list_backups(module)?.iter().map(|b| b.size).sum())
    }

    pub fn latest_backup(&self, module: &str) -> Result<Option<BackupInfo>, UpdateError> {
        Ok(self.list_backups(module)?.into_iter().next())
    }

    pub fn find_backup(
        &self,
        module: &str,
        version: &ModuleVersion,
    ) -> Result<Option<BackupInfo>, UpdateError> {
        Ok(self
            .list_backups(module)?
            .into_iter()
            .find(|b| &b.version == version))
    }

    /// Delete one backup. Pinned backups are refused.
    pub fn delete_backup(&self, backup: &BackupInfo) -> Result<(), UpdateError> {
        if self.is_pinned(&backup.path) {
            return Err(UpdateError::BackupFailed {
                module: backup.module.clone(),
                reason: format!("backup {} is in use by an update", backup.path.display()),
            });
        }
        if backup.path.exists() {
            fs::remove_dir_all(&backup.path)?;
            info!("Deleted backup: {:?}", backup.path);
        }
        Ok(())
    }

    /// Keep the newest `max_backups` backups of `module` and delete the rest.
    ///
    /// Backups pinned by an in-progress update are never deleted.
    ///
    /// # Returns
    ///
    /// The number of backups deleted.
    pub fn cleanup_old_backups(&self, module: &str) -> Result<usize, UpdateError> {
        let backups = self.list_backups(module)?;
        if backups.len() <= self.max_backups {
            return Ok(0);
        }

        let mut deleted = 0;
        for backup in backups.iter().skip(self.max_backups) {
            if self.is_pinned(&backup.path) {
                debug!(path = %backup.path.display(), "Keeping pinned backup");
                continue;
            }
            info!("Removing old backup: {:?}", backup.path);
            match fs::remove_dir_all(&backup.path) {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to remove old backup {:?}: {}", backup.path, e),
            }
        }
        Ok(deleted)
    }

    /// Protect the backup at `path` from cleanup while the guard lives.
    pub fn pin(&self, path: &Path) -> BackupPin {
        self.pinned().insert(path.to_path_buf());
        BackupPin {
            path: path.to_path_buf(),
            pinned: self.pinned.clone(),
        }
    }

    pub fn is_pinned(&self, path: &Path) -> bool {
        self.pinned().contains(path)
    }
}

/// Keeps a backup out of cleanup until dropped.
#[derive(Debug)]
pub struct BackupPin {
    path: PathBuf,
    pinned: Arc<Mutex<HashSet<PathBuf>>>,
}

impl BackupPin {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BackupPin {
    fn drop(&mut self) {
        self.pinned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.path);
    }
}

// ============================================================================
// File helpers
// ============================================================================

fn unique_dir(parent: &Path, name: &str) -> PathBuf {
    let mut candidate = parent.join(name);
    let mut n = 1;
    while candidate.exists() {
        candidate = parent.join(format!("{name}-{n}"));
        n += 1;
    }
    candidate
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string());
    path.with_file_name(format!(".{name}.{suffix}"))
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Copy the contents of `src` into the existing directory `dst`.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            copy_symlink(&entry.path(), &target)?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Recreate the link at `src` as `dst`, pointing at the same target.
#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(src)?, dst)
}

#[cfg(windows)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    if fs::metadata(src).map(|m| m.is_dir()).unwrap_or(false) {
        std::os::windows::fs::symlink_dir(link, dst)
    } else {
        std::os::windows::fs::symlink_file(link, dst)
    }
}

#[cfg(not(any(unix, windows)))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

/// Files and links under `dir`, keyed by `/`-separated path relative to `root`.
///
/// Links are listed, not followed.
fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf, bool)>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push((relative, path, file_type.is_symlink()));
        }
    }
    Ok(())
}

/// Digest and total size of every file under `root`.
fn content_digest(root: &Path) -> Result<(String, u64), UpdateError> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    let mut size = 0u64;
    for (relative, path, is_link) in &files {
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        if *is_link {
            hasher.update(b"link:");
            hasher.update(fs::read_link(path)?.to_string_lossy().as_bytes());
        } else {
            size += fs::metadata(path)?.len();
            hasher.update(checksum::compute_hex(path)?.as_bytes());
        }
        hasher.update(b"\n");
    }
    Ok((hex::encode(hasher.finalize()), size))
}
