//! `module.json` manifests and module directory scanning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::module::{Requirements, RepositoryRef};
use crate::version::ModuleVersion;

/// File name of the manifest inside every module directory.
pub const MANIFEST_FILE: &str = "module.json";

/// On-disk description of a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub name: String,
    #[serde(default, alias = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: ModuleVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub requires: Requirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel: Option<String>,
}

impl ModuleManifest {
    /// Read and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::InvalidManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_json(&content, path)
    }

    /// Parse and validate manifest JSON; `path` is only used for error reporting.
    pub fn from_json(content: &str, path: &Path) -> Result<Self, CoreError> {
        let manifest: Self =
            serde_json::from_str(content).map_err(|e| CoreError::InvalidManifest {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        manifest.validate().map_err(|reason| CoreError::InvalidManifest {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(manifest)
    }

    /// Check naming rules that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if !is_kebab_case(&self.name) {
            return Err(format!("module name {:?} is not kebab-case", self.name));
        }
        for dep in self.dependencies.iter().chain(self.requires.modules.keys()) {
            if !is_kebab_case(dep) {
                return Err(format!("dependency name {dep:?} is not kebab-case"));
            }
            if *dep == self.name {
                return Err(format!("module {} depends on itself", self.name));
            }
        }
        if let Some(panel) = &self.panel {
            let panel_path = Path::new(panel);
            if panel_path.is_absolute()
                || panel_path
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(format!("panel path {panel:?} must stay inside the module"));
            }
        }
        Ok(())
    }
}

/// Lowercase ASCII words separated by single hyphens, e.g. `blog-posts`.
pub fn is_kebab_case(name: &str) -> bool {
    !name.is_empty()
        && name.split('-').all(|word| {
            !word.is_empty()
                && word
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        })
        && name.starts_with(|c: char| c.is_ascii_lowercase())
}

/// Outcome of scanning a modules directory.
#[derive(Debug, Default)]
pub struct ManifestScan {
    /// Valid manifests with the directory each was found in
    pub found: Vec<(PathBuf, ModuleManifest)>,
    /// Manifests that could not be used, one error per directory
    pub invalid: Vec<CoreError>,
}

/// Scan `<dir>/*/module.json`.
///
/// A missing directory yields an empty scan. Directories are visited in name
/// order so duplicate detection is deterministic.
pub fn scan_modules_dir(dir: &Path) -> Result<ManifestScan, CoreError> {
    let mut scan = ManifestScan::default();
    if !dir.exists() {
        debug!("Modules directory {} does not exist", dir.display());
        return Ok(scan);
    }

    let mut dirs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    for module_dir in dirs {
        let manifest_path = module_dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            debug!("Skipping {} (no manifest)", module_dir.display());
            continue;
        }

        match ModuleManifest::load(&manifest_path) {
            Ok(manifest) => {
                if let Some(first) = seen.get(&manifest.name) {
                    warn!("Duplicate module {} in {}", manifest.name, module_dir.display());
                    scan.invalid.push(CoreError::DuplicateModule {
                        name: manifest.name.clone(),
                        first: first.clone(),
                        second: module_dir,
                    });
                    continue;
                }
                seen.insert(manifest.name.clone(), module_dir.clone());
                scan.found.push((module_dir, manifest));
            }
            Err(e) => {
                warn!("Ignoring invalid manifest: {}", e);
                scan.invalid.push(e);
            }
        }
    }

    Ok(scan)
}
