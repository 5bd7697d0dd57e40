//! # modhost-updater
//!
//! In-place updates for installed modhost modules.
//!
//! This crate handles:
//! - Release lookup against a pluggable release source (GitHub by default)
//! - Artifact download with progress reporting and SHA-256 verification
//! - Backups of installed module files with integrity digests and retention
//! - Applying archives, running migrations and seeders, and health checks
//! - Automatic rollback when anything fails after the files were replaced
//!
//! ## Safety
//!
//! - Nothing on disk changes until the artifact has been verified and a
//!   backup of the installed module exists
//! - Only one update per module runs at a time
//! - Every attempt leaves an immutable history record

pub mod backup;
pub mod checksum;
pub mod config;
pub mod download;
pub mod error;
pub mod health;
pub mod history;
pub mod install;
pub mod lock;
pub mod migrate;
pub mod orchestrator;
#[cfg(test)]
mod proptests;
pub mod release;
pub mod status;

// Re-export main types for convenience
pub use backup::{BackupInfo, BackupManager, BackupPin};
pub use config::{HealthConfig, NetworkConfig, ReleaseConfig, RollbackConfig, UpdateConfig};
pub use download::{DownloadProgress, Downloader, DownloaderConfig, ProgressCallback};
pub use error::{Severity, UpdateError};
pub use health::{HealthCheckResult, HealthChecker, InstalledModuleRuntime, ModuleRuntime, ProbeOutcome};
pub use history::{HistoryStore, InMemoryHistoryStore, JsonFileHistoryStore, UpdateRecord};
pub use install::{ArchiveInstaller, ModuleInstaller};
pub use lock::{UpdateGuard, UpdateLocks};
pub use migrate::{CommandMigrationRunner, MigrationRunner, NoopMigrationRunner};
pub use orchestrator::{AvailableUpdate, UpdateOrchestrator, UpdateOutcome, UpdatePreview};
pub use release::{parse_core_requirement, GitHubReleaseSource, ReleaseInfo, ReleaseSource};
pub use status::{StatusStyle, UpdateStatus};
