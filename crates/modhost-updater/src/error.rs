//! Error types for the update system.

use std::path::PathBuf;

use modhost_core::{CoreError, StoreError};
use thiserror::Error;
use uuid::Uuid;

use crate::status::UpdateStatus;

/// How bad an update error is for the installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Nothing was changed; fix the cause and retry
    Recoverable,
    /// The update failed but the previous version was restored
    Handled,
    /// The module is in an unknown state and needs an operator
    Fatal,
}

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Fetching release metadata or the artifact failed or timed out
    #[error("download failed for {module}: {reason}")]
    DownloadFailed { module: String, reason: String },

    /// The staged artifact does not match its published checksum
    #[error("checksum mismatch for {module}: {reason}")]
    ChecksumMismatch { module: String, reason: String },

    #[error("backup failed for {module}: {reason}")]
    BackupFailed { module: String, reason: String },

    #[error("extraction failed for {module}: {reason}")]
    ExtractionFailed { module: String, reason: String },

    #[error("migration failed for {module}: {reason}")]
    MigrationFailed { module: String, reason: String },

    #[error("health check failed for {module}: {}", .errors.join("; "))]
    HealthCheckFailed { module: String, errors: Vec<String> },

    #[error("release {tag} of {module} has no downloadable assets")]
    NoDownloadableAssets { module: String, tag: String },

    #[error("no update available for {module}")]
    NoUpdateAvailable { module: String },

    #[error("module {module} has no release source configured")]
    NoSourceConfigured { module: String },

    #[error("{module} {version} requires core {constraint}, running {core}")]
    CoreIncompatible {
        module: String,
        version: String,
        constraint: String,
        core: String,
    },

    /// Another update of the same module holds the lock
    #[error("an update of {module} is already in progress")]
    LockAcquisitionFailed { module: String },

    #[error("update of {module} was cancelled")]
    Cancelled { module: String },

    #[error("cannot cancel the update of {module}: already {status}")]
    CancellationRefused { module: String, status: UpdateStatus },

    #[error("no update in progress for {module}")]
    NoUpdateInProgress { module: String },

    #[error("backup not found: {}", .path.display())]
    BackupNotFound { path: PathBuf },

    #[error("backup at {} failed its integrity check: {reason}", .path.display())]
    BackupCorrupted { path: PathBuf, reason: String },

    /// The update failed after files were touched, and the backup was restored
    #[error("update of {module} failed and was rolled back: {cause}")]
    RolledBack {
        module: String,
        cause: Box<UpdateError>,
    },

    /// The update failed and restoring the backup failed too
    #[error("rollback of {module} failed after {cause}: {reason}; manual intervention required")]
    RollbackFailed {
        module: String,
        cause: Box<UpdateError>,
        reason: String,
    },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: UpdateStatus, to: UpdateStatus },

    #[error("update record {0} is terminal and cannot change")]
    RecordImmutable(Uuid),

    #[error("update record not found: {0}")]
    HistoryRecordNotFound(Uuid),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::Http(err.to_string())
    }
}

impl UpdateError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::RollbackFailed { .. } => Severity::Fatal,
            Self::RolledBack { .. } => Severity::Handled,
            _ => Severity::Recoverable,
        }
    }

    /// The module the error is about, when it names one.
    pub fn module(&self) -> Option<&str> {
        match self {
            Self::DownloadFailed { module, .. }
            | Self::ChecksumMismatch { module, .. }
            | Self::BackupFailed { module, .. }
            | Self::ExtractionFailed { module, .. }
            | Self::MigrationFailed { module, .. }
            | Self::HealthCheckFailed { module, .. }
            | Self::NoDownloadableAssets { module, .. }
            | Self::NoUpdateAvailable { module }
            | Self::NoSourceConfigured { module }
            | Self::CoreIncompatible { module, .. }
            | Self::LockAcquisitionFailed { module }
            | Self::Cancelled { module }
            | Self::CancellationRefused { module, .. }
            | Self::NoUpdateInProgress { module }
            | Self::RolledBack { module, .. }
            | Self::RollbackFailed { module, .. } => Some(module),
            _ => None,
        }
    }

    /// The original failure behind a rollback, or the error itself.
    pub fn root_cause(&self) -> &UpdateError {
        match self {
            Self::RolledBack { cause, .. } | Self::RollbackFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(module: &str) -> UpdateError {
        UpdateError::HealthCheckFailed {
            module: module.into(),
            errors: vec!["provider did not load".into(), "route /blog returned 500".into()],
        }
    }

    #[test]
    fn test_severity_classes() {
        assert_eq!(health("blog").severity(), Severity::Recoverable);
        let rolled = UpdateError::RolledBack {
            module: "blog".into(),
            cause: Box::new(health("blog")),
        };
        assert_eq!(rolled.severity(), Severity::Handled);
        let fatal = UpdateError::RollbackFailed {
            module: "blog".into(),
            cause: Box::new(health("blog")),
            reason: "disk full".into(),
        };
        assert_eq!(fatal.severity(), Severity::Fatal);
        assert!(Severity::Fatal > Severity::Handled);
    }

    #[test]
    fn test_messages_name_module_and_detail() {
        let err = health("blog");
        assert_eq!(
            err.to_string(),
            "health check failed for blog: provider did not load; route /blog returned 500"
        );
        assert_eq!(err.module(), Some("blog"));

        let fatal = UpdateError::RollbackFailed {
            module: "blog".into(),
            cause: Box::new(err),
            reason: "disk full".into(),
        };
        assert!(fatal.to_string().contains("manual intervention required"));
        assert!(matches!(fatal.root_cause(), UpdateError::HealthCheckFailed { .. }));
    }
}
