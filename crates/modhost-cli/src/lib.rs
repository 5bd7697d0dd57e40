//! modhost CLI - module lifecycle and self-update
//!
//! This crate provides a command-line interface for:
//! - Discovering installed modules and reconciling the registry
//! - Enabling, disabling and uninstalling modules
//! - Previewing, applying and rolling back module updates
//! - Inspecting backups and update history

pub mod app;
pub mod cli;
pub mod config;
pub mod output;

#[cfg(test)]
mod proptests;

use modhost_core::CoreError;
use modhost_updater::UpdateError;

pub use app::App;
pub use cli::Cli;
pub use config::{CliOverrides, Config, ConfigError};
pub use output::{JsonResponse, OutputFormat, OutputFormatter, SuccessMessage};

/// Exit codes for CLI operations
///
/// Exit codes provide machine-readable status for scripting and automation:
/// - 0: Success - operation completed successfully
/// - 1: General error - unspecified error occurred
/// - 2: Invalid input - bad arguments, unknown module or illegal operation
/// - 3: Dependency conflict - the module graph forbids the operation
/// - 4: Update failed - nothing was changed
/// - 5: Rolled back - the update failed and the previous version was restored
/// - 6: Rollback failed - the module needs manual intervention
/// - 7: Lock held - another update of the module is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Operation completed successfully (exit code 0)
    Success = 0,
    /// General error (exit code 1)
    GeneralError = 1,
    /// Invalid input or contract violation (exit code 2)
    InvalidInput = 2,
    /// Dependency conflict (exit code 3)
    DependencyConflict = 3,
    /// Update failed without touching the installation (exit code 4)
    UpdateFailed = 4,
    /// Update failed and was rolled back (exit code 5)
    RolledBack = 5,
    /// Rollback failed (exit code 6)
    RollbackFailed = 6,
    /// Update lock held (exit code 7)
    LockHeld = 7,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    /// Get the exit code name as a string
    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::DependencyConflict => "DEPENDENCY_CONFLICT",
            ExitCode::UpdateFailed => "UPDATE_FAILED",
            ExitCode::RolledBack => "ROLLED_BACK",
            ExitCode::RollbackFailed => "ROLLBACK_FAILED",
            ExitCode::LockHeld => "LOCK_HELD",
        }
    }

    /// Get a human-readable description of the exit code
    pub fn description(&self) -> &'static str {
        match self {
            ExitCode::Success => "Operation completed successfully",
            ExitCode::GeneralError => "An unspecified error occurred",
            ExitCode::InvalidInput => "Invalid arguments or operation not allowed",
            ExitCode::DependencyConflict => "The module dependency graph forbids the operation",
            ExitCode::UpdateFailed => "Update failed; the installation was not changed",
            ExitCode::RolledBack => "Update failed; the previous version was restored",
            ExitCode::RollbackFailed => "Rollback failed; manual intervention required",
            ExitCode::LockHeld => "Another update of the module is in progress",
        }
    }

    /// Pick the exit code for an error returned by a command.
    pub fn from_error(error: &anyhow::Error) -> Self {
        if let Some(err) = error.downcast_ref::<UpdateError>() {
            return Self::from_update_error(err);
        }
        if let Some(err) = error.downcast_ref::<CoreError>() {
            return Self::from_core_error(err);
        }
        if error.downcast_ref::<ConfigError>().is_some() {
            return ExitCode::InvalidInput;
        }
        ExitCode::GeneralError
    }

    pub fn from_core_error(error: &CoreError) -> Self {
        if error.is_dependency_conflict() {
            return ExitCode::DependencyConflict;
        }
        match error {
            CoreError::Store(_) | CoreError::Io(_) => ExitCode::GeneralError,
            _ => ExitCode::InvalidInput,
        }
    }

    pub fn from_update_error(error: &UpdateError) -> Self {
        match error {
            UpdateError::RolledBack { .. } => ExitCode::RolledBack,
            UpdateError::RollbackFailed { .. } => ExitCode::RollbackFailed,
            UpdateError::LockAcquisitionFailed { .. } => ExitCode::LockHeld,
            UpdateError::Core(err) => Self::from_core_error(err),
            UpdateError::NoUpdateAvailable { .. }
            | UpdateError::NoSourceConfigured { .. }
            | UpdateError::CancellationRefused { .. }
            | UpdateError::NoUpdateInProgress { .. }
            | UpdateError::BackupNotFound { .. }
            | UpdateError::Config(_) => ExitCode::InvalidInput,
            UpdateError::DownloadFailed { .. }
            | UpdateError::ChecksumMismatch { .. }
            | UpdateError::BackupFailed { .. }
            | UpdateError::BackupCorrupted { .. }
            | UpdateError::ExtractionFailed { .. }
            | UpdateError::MigrationFailed { .. }
            | UpdateError::HealthCheckFailed { .. }
            | UpdateError::NoDownloadableAssets { .. }
            | UpdateError::CoreIncompatible { .. }
            | UpdateError::Cancelled { .. }
            | UpdateError::Http(_) => ExitCode::UpdateFailed,
            _ => ExitCode::GeneralError,
        }
    }
}
