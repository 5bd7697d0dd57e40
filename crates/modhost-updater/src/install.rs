//! Applying a downloaded release to the installed module.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use modhost_core::{Module, ModuleManifest, MANIFEST_FILE};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::UpdateError;

/// Replaces a module's installed files with a release artifact.
#[async_trait]
pub trait ModuleInstaller: Send + Sync {
    /// Install `artifact` over `module`'s directory.
    ///
    /// # Returns
    ///
    /// The manifest shipped in the artifact.
    async fn install(&self, module: &Module, artifact: &Path) -> Result<ModuleManifest, UpdateError>;
}

/// Installs zip archives.
///
/// The archive is extracted next to the module directory and swapped in
/// with two renames, so the module directory always holds either the old or
/// the new release in full. An archive that wraps everything in a single
/// top-level directory is unwrapped.
#[derive(Debug, Default, Clone)]
pub struct ArchiveInstaller;

impl ArchiveInstaller {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModuleInstaller for ArchiveInstaller {
    async fn install(&self, module: &Module, artifact: &Path) -> Result<ModuleManifest, UpdateError> {
        let name = module.name.clone();
        let target = module.path.clone();
        let artifact = artifact.to_path_buf();
        tokio::task::spawn_blocking(move || install_archive(&name, &target, &artifact))
            .await
            .map_err(|e| UpdateError::ExtractionFailed {
                module: module.name.clone(),
                reason: format!("installer task failed: {e}"),
            })?
    }
}

fn install_archive(module: &str, target: &Path, artifact: &Path) -> Result<ModuleManifest, UpdateError> {
    let failed = |reason: String| UpdateError::ExtractionFailed {
        module: module.to_string(),
        reason,
    };

    let parent = target
        .parent()
        .ok_or_else(|| failed(format!("{} has no parent directory", target.display())))?;
    fs::create_dir_all(parent).map_err(|e| failed(e.to_string()))?;

    let extract_dir = parent.join(format!(".{module}.update-{}", Uuid::new_v4().simple()));
    let result = extract_and_swap(module, target, artifact, &extract_dir);
    if extract_dir.exists() {
        if let Err(e) = fs::remove_dir_all(&extract_dir) {
            warn!(path = %extract_dir.display(), error = %e, "Failed to remove extraction directory");
        }
    }
    result.map_err(failed)
}

fn extract_and_swap(
    module: &str,
    target: &Path,
    artifact: &Path,
    extract_dir: &Path,
) -> Result<ModuleManifest, String> {
    fs::create_dir_all(extract_dir).map_err(|e| e.to_string())?;
    extract_zip(artifact, extract_dir)?;

    let root = locate_module_root(extract_dir)
        .ok_or_else(|| format!("archive contains no {MANIFEST_FILE}"))?;
    let manifest = ModuleManifest::load(&root.join(MANIFEST_FILE)).map_err(|e| e.to_string())?;
    if manifest.name != module {
        return Err(format!(
            "archive contains module {}, expected {}",
            manifest.name, module
        ));
    }

    swap_into_place(&root, target).map_err(|e| format!("failed to replace module files: {e}"))?;
    info!(module, version = %manifest.version, path = %target.display(), "Module files replaced");
    Ok(manifest)
}

/// The directory holding `module.json`: the extraction root itself, or its
/// only child directory.
fn locate_module_root(extract_dir: &Path) -> Option<PathBuf> {
    if extract_dir.join(MANIFEST_FILE).is_file() {
        return Some(extract_dir.to_path_buf());
    }
    let entries: Vec<PathBuf> = fs::read_dir(extract_dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    match entries.as_slice() {
        [only] if only.is_dir() && only.join(MANIFEST_FILE).is_file() => Some(only.clone()),
        _ => None,
    }
}

fn swap_into_place(new_root: &Path, target: &Path) -> io::Result<()> {
    let previous = target.with_file_name(format!(
        ".{}.update-old",
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));
    if previous.exists() {
        fs::remove_dir_all(&previous)?;
    }

    let had_previous = target.exists();
    if had_previous {
        fs::rename(target, &previous)?;
    }
    if let Err(e) = fs::rename(new_root, target) {
        if had_previous {
            let _ = fs::rename(&previous, target);
        }
        return Err(e);
    }
    if had_previous {
        if let Err(e) = fs::remove_dir_all(&previous) {
            warn!(path = %previous.display(), error = %e, "Failed to remove replaced files");
        }
    }
    Ok(())
}

fn extract_zip(zip_path: &Path, dest: &Path) -> Result<(), String> {
    let file = fs::File::open(zip_path)
        .map_err(|e| format!("failed to open {}: {e}", zip_path.display()))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| format!("failed to read zip archive: {e}"))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| format!("failed to read zip entry: {e}"))?;
        let Some(name) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "Skipping zip entry with unsafe path");
            continue;
        };
        let out_path = dest.join(name);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .map_err(|e| format!("failed to create {}: {e}", out_path.display()))?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
            }
            let mut outfile = fs::File::create(&out_path)
                .map_err(|e| format!("failed to create {}: {e}", out_path.display()))?;
            io::copy(&mut entry, &mut outfile)
                .map_err(|e| format!("failed to extract {}: {e}", out_path.display()))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    let _ = fs::set_permissions(&out_path, fs::Permissions::from_mode(mode));
                }
            }
        }
    }

    debug!("Extraction complete to {}", dest.display());
    Ok(())
}
