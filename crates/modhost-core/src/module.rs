//! Module records and the live host environment.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::manifest::{ModuleManifest, MANIFEST_FILE};
use crate::version::{ModuleVersion, VersionConstraint};

/// Whether a module is active in the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    Enabled,
    Disabled,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => write!(f, "enabled"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Requirements a module places on its environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    /// Constraint on the host core version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core: Option<VersionConstraint>,

    /// Required modules and the versions they must satisfy
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub modules: BTreeMap<String, VersionConstraint>,

    /// Runtime extensions that must be loaded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
}

/// A remote release repository, written `owner/repo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryRef {
    pub owner: String,
    pub repo: String,
}

impl RepositoryRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

impl FromStr for RepositoryRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('/') {
            Some((owner, repo))
                if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') =>
            {
                Ok(Self::new(owner, repo))
            }
            _ => Err(format!("expected owner/repo, got {s:?}")),
        }
    }
}

impl Serialize for RepositoryRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RepositoryRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An installed module.
///
/// Status only changes through the registry's enable/disable operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Kebab-case identifier, unique across the installation
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub version: ModuleVersion,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub requirements: Requirements,
    /// Modules this one depends on, in declaration order
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Where updates are published
    #[serde(default)]
    pub repository: Option<RepositoryRef>,
    /// Admin panel entry point, relative to the module directory
    #[serde(default)]
    pub panel: Option<String>,
    /// Installed module directory
    pub path: PathBuf,
    status: ModuleStatus,
    #[serde(default)]
    enabled_at: Option<DateTime<Utc>>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Module {
    /// Build a freshly discovered, disabled module from its manifest.
    pub fn from_manifest(manifest: ModuleManifest, path: PathBuf, now: DateTime<Utc>) -> Self {
        let mut module = Self {
            name: manifest.name.clone(),
            display_name: String::new(),
            description: None,
            version: manifest.version.clone(),
            author: None,
            namespace: None,
            provider: None,
            requirements: Requirements::default(),
            dependencies: Vec::new(),
            repository: None,
            panel: None,
            path,
            status: ModuleStatus::Disabled,
            enabled_at: None,
            installed_at: now,
            updated_at: now,
        };
        module.refresh_from_manifest(manifest);
        module
    }

    /// Copy descriptive fields from a re-read manifest, keeping status and timestamps.
    pub fn refresh_from_manifest(&mut self, manifest: ModuleManifest) {
        self.display_name = manifest
            .display_name
            .unwrap_or_else(|| title_case(&manifest.name));
        self.description = manifest.description;
        self.version = manifest.version;
        self.author = manifest.author;
        self.namespace = manifest.namespace;
        self.provider = manifest.provider;
        self.requirements = manifest.requires;
        self.dependencies = manifest.dependencies;
        self.repository = manifest.repository;
        self.panel = manifest.panel;
    }

    pub fn status(&self) -> ModuleStatus {
        self.status
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ModuleStatus::Enabled
    }

    pub fn enabled_at(&self) -> Option<DateTime<Utc>> {
        self.enabled_at
    }

    pub(crate) fn mark_enabled(&mut self, now: DateTime<Utc>) {
        self.status = ModuleStatus::Enabled;
        self.enabled_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_disabled(&mut self, now: DateTime<Utc>) {
        self.status = ModuleStatus::Disabled;
        self.enabled_at = None;
        self.updated_at = now;
    }

    /// Every module this one depends on: the declared dependency list plus
    /// modules named in `requires`, deduplicated and sorted.
    pub fn dependency_names(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .dependencies
            .iter()
            .chain(self.requirements.modules.keys())
            .collect();
        names.into_iter().cloned().collect()
    }

    /// The version constraint this module places on `dependency`, if any.
    pub fn constraint_for(&self, dependency: &str) -> Option<&VersionConstraint> {
        self.requirements.modules.get(dependency)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    pub fn is_installed_at(&self, path: &Path) -> bool {
        self.path == path
    }
}

fn title_case(name: &str) -> String {
    name.split('-')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// The live host environment that module requirements are checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub core_version: ModuleVersion,
    pub extensions: BTreeSet<String>,
}

impl Environment {
    pub fn new(core_version: ModuleVersion) -> Self {
        Self {
            core_version,
            extensions: BTreeSet::new(),
        }
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions
            .extend(extensions.into_iter().map(|e| e.into().to_ascii_lowercase()));
        self
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.contains(&name.to_ascii_lowercase())
    }

    /// Whether a core-version constraint accepts this environment.
    pub fn core_satisfies(&self, constraint: Option<&VersionConstraint>) -> bool {
        constraint.map_or(true, |c| c.satisfied_by(&self.core_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(json: &str) -> ModuleManifest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_from_manifest_starts_disabled() {
        let now = Utc::now();
        let module = Module::from_manifest(
            manifest(r#"{"name": "blog-posts", "version": "1.2.0"}"#),
            PathBuf::from("/srv/modules/blog-posts"),
            now,
        );
        assert_eq!(module.status(), ModuleStatus::Disabled);
        assert_eq!(module.display_name, "Blog Posts");
        assert_eq!(module.installed_at, now);
        assert!(module.enabled_at().is_none());
    }

    #[test]
    fn test_dependency_names_merges_requires() {
        let module = Module::from_manifest(
            manifest(
                r#"{
                    "name": "shop",
                    "version": "1.0.0",
                    "dependencies": ["media", "users"],
                    "requires": {"modules": {"media": "^2.0", "payments": "~1.1"}}
                }"#,
            ),
            PathBuf::from("/m/shop"),
            Utc::now(),
        );
        assert_eq!(module.dependency_names(), vec!["media", "payments", "users"]);
        assert_eq!(module.constraint_for("media").unwrap().as_str(), "^2.0");
        assert!(module.constraint_for("users").is_none());
    }

    #[test]
    fn test_status_transitions() {
        let mut module = Module::from_manifest(
            manifest(r#"{"name": "a", "version": "1.0.0"}"#),
            PathBuf::from("/m/a"),
            Utc::now(),
        );
        let now = Utc::now();
        module.mark_enabled(now);
        assert!(module.is_enabled());
        assert_eq!(module.enabled_at(), Some(now));
        module.mark_disabled(now);
        assert!(!module.is_enabled());
        assert!(module.enabled_at().is_none());
    }

    #[test]
    fn test_repository_ref_parse() {
        let repo: RepositoryRef = "acme/blog-module".parse().unwrap();
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.repo, "blog-module");
        assert_eq!(repo.to_string(), "acme/blog-module");
        assert!("acme".parse::<RepositoryRef>().is_err());
        assert!("a/b/c".parse::<RepositoryRef>().is_err());
        assert!("/b".parse::<RepositoryRef>().is_err());
    }

    #[test]
    fn test_environment_extensions_case_insensitive() {
        let env = Environment::new(ModuleVersion::new(10, 0, 0)).with_extensions(["GD", "intl"]);
        assert!(env.has_extension("gd"));
        assert!(env.has_extension("INTL"));
        assert!(!env.has_extension("redis"));
        assert!(env.core_satisfies(None));
        assert!(env.core_satisfies(Some(&VersionConstraint::parse("^10.0").unwrap())));
        assert!(!env.core_satisfies(Some(&VersionConstraint::parse("^11.0").unwrap())));
    }
}
