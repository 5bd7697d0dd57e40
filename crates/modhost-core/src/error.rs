//! Error types for module graph and registry operations.
//!
//! Every graph/contract error is raised before any module state changes,
//! so callers can correct their input and retry.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreError;
use crate::version::VersionError;

/// Why a dependency is considered missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingReason {
    /// No module with that name is installed
    NotInstalled,
    /// The module is installed but disabled
    Disabled,
    /// A required runtime extension is not loaded
    ExtensionNotLoaded,
}

impl fmt::Display for MissingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInstalled => write!(f, "not installed"),
            Self::Disabled => write!(f, "disabled"),
            Self::ExtensionNotLoaded => write!(f, "extension not loaded"),
        }
    }
}

/// Errors from module discovery, dependency resolution, and registry operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("module {0} is already enabled")]
    AlreadyEnabled(String),

    #[error("module {0} is already disabled")]
    AlreadyDisabled(String),

    /// A dependency cycle; `cycle` lists each module on the cycle once
    #[error("circular dependency detected: {}", format_cycle(.cycle))]
    CircularDependencyDetected { cycle: Vec<String> },

    #[error("module {module} requires {dependency} ({reason})")]
    MissingDependency {
        module: String,
        dependency: String,
        reason: MissingReason,
    },

    #[error("module {module} requires {dependency} {constraint}, found {found}")]
    VersionMismatch {
        module: String,
        dependency: String,
        constraint: String,
        found: String,
    },

    #[error("cannot remove {module}: required by {}", .dependents.join(", "))]
    DependentModulesExist {
        module: String,
        dependents: Vec<String>,
    },

    #[error("module {0} must be disabled before it can be uninstalled")]
    ModuleEnabled(String),

    #[error("invalid module name {0:?}: expected kebab-case")]
    InvalidModuleName(String),

    #[error("invalid manifest at {}: {reason}", .path.display())]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("module {name} is declared by both {} and {}", .first.display(), .second.display())]
    DuplicateModule {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {}", cycle.join(" -> "), first),
        None => String::from("(empty)"),
    }
}

impl CoreError {
    /// Whether this error is a dependency-graph conflict rather than bad input.
    pub fn is_dependency_conflict(&self) -> bool {
        matches!(
            self,
            Self::CircularDependencyDetected { .. }
                | Self::MissingDependency { .. }
                | Self::VersionMismatch { .. }
                | Self::DependentModulesExist { .. }
        )
    }
}
