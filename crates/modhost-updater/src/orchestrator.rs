//! Update orchestrator - runs the module update pipeline.
//!
//! An update moves through
//! `Pending → Downloading → Verifying → BackingUp → Applying → Migrating →
//! Seeding → HealthChecking → Completed`. Anything that fails before the
//! backup exists ends `Failed` with nothing changed on disk. Anything that
//! fails afterwards restores the backup and ends `RolledBack`; if the restore
//! fails too the error escapes as `RollbackFailed`.
//!
//! One update per module runs at a time. `preview` never takes the lock.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use modhost_core::{Module, ModuleEvent, ModuleRegistry, ModuleVersion, VersionConstraint};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupInfo, BackupManager, BackupPin};
use crate::checksum;
use crate::config::UpdateConfig;
use crate::download::{DownloadProgress, ProgressCallback};
use crate::error::UpdateError;
use crate::health::{HealthChecker, InstalledModuleRuntime};
use crate::history::{HistoryStore, InMemoryHistoryStore, UpdateRecord};
use crate::install::{ArchiveInstaller, ModuleInstaller};
use crate::lock::{UpdateGuard, UpdateLocks};
use crate::migrate::{MigrationRunner, NoopMigrationRunner};
use crate::release::{ReleaseInfo, ReleaseSource};
use crate::status::UpdateStatus;

/// Message stored on the record of a cancelled update.
const CANCELLED_MESSAGE: &str = "update cancelled";

/// What an update of a module would do. Computed without side effects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdatePreview {
    pub module: String,
    /// Currently installed version
    pub from_version: ModuleVersion,
    pub to_version: ModuleVersion,
    pub tag: String,
    pub is_major: bool,
    pub core_compatible: bool,
    pub requires_core: Option<VersionConstraint>,
    /// Migrations of the installed files that have not run yet. Steps the
    /// release adds are only known once its archive is downloaded.
    pub installed_pending_migrations: Vec<String>,
    pub installed_pending_seeders: Vec<String>,
    pub changelog: String,
    pub published_at: Option<DateTime<Utc>>,
    pub has_checksum: bool,
}

/// A completed update.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub record: UpdateRecord,
    pub backup: BackupInfo,
    /// Advisory health check findings
    pub warnings: Vec<String>,
}

/// A module whose latest release is newer than what is installed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableUpdate {
    pub module: String,
    pub installed: ModuleVersion,
    pub release: ReleaseInfo,
    pub is_major: bool,
    pub core_compatible: bool,
}

/// Steps that were pending when an attempt started running them.
///
/// A rollback marks them as not run again, since the restored files predate
/// them.
#[derive(Debug, Default)]
struct AttemptedSteps {
    migrations: Vec<String>,
    seeders: Vec<String>,
}

/// Removes the staging directory of an attempt when dropped.
struct StagingDir {
    path: PathBuf,
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove staging directory");
            }
        }
    }
}

/// Sequences release lookup, verification, backup, apply, migrations,
/// health check and rollback for module updates.
pub struct UpdateOrchestrator {
    registry: Arc<ModuleRegistry>,
    source: Arc<dyn ReleaseSource>,
    backups: BackupManager,
    installer: Arc<dyn ModuleInstaller>,
    migrations: Arc<dyn MigrationRunner>,
    health: Arc<HealthChecker>,
    history: Arc<dyn HistoryStore>,
    locks: UpdateLocks,
    config: UpdateConfig,
    progress: Option<ProgressCallback>,
}

impl UpdateOrchestrator {
    /// Create an orchestrator with the archive installer, no migrations, the
    /// installed-files health checker and in-memory history.
    pub fn new(
        registry: Arc<ModuleRegistry>,
        source: Arc<dyn ReleaseSource>,
        backups: BackupManager,
        config: UpdateConfig,
    ) -> Result<Self, UpdateError> {
        let runtime = InstalledModuleRuntime::new(&config.health, config.network.timeout())?;
        Ok(Self {
            registry,
            source,
            backups,
            installer: Arc::new(ArchiveInstaller::new()),
            migrations: Arc::new(NoopMigrationRunner),
            health: Arc::new(HealthChecker::new(Arc::new(runtime))),
            history: Arc::new(InMemoryHistoryStore::new()),
            locks: UpdateLocks::new(),
            config,
            progress: None,
        })
    }

    pub fn with_installer(mut self, installer: Arc<dyn ModuleInstaller>) -> Self {
        self.installer = installer;
        self
    }

    pub fn with_migrations(mut self, migrations: Arc<dyn MigrationRunner>) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn with_health_checker(mut self, health: HealthChecker) -> Self {
        self.health = Arc::new(health);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = history;
        self
    }

    /// Share locks with another orchestrator over the same modules.
    pub fn with_locks(mut self, locks: UpdateLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(DownloadProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Describe the update `update(name)` would perform.
    ///
    /// Takes no lock and changes nothing, so it is safe to call while an
    /// update of the same module is running; `from_version` is always the
    /// installed version.
    pub async fn preview(&self, name: &str) -> Result<UpdatePreview, UpdateError> {
        let module = self.registry.find(name).await?;
        let release = self.resolve_release(&module).await?;

        let installed_pending_migrations = self.migrations.pending_migrations(&module).await?;
        let installed_pending_seeders = self.migrations.pending_seeders(&module).await?;
        let core = &self.registry.environment().core_version;

        Ok(UpdatePreview {
            module: module.name.clone(),
            is_major: release.is_major_upgrade_from(&module.version),
            core_compatible: release.is_compatible_with(core),
            from_version: module.version.clone(),
            to_version: release.version.clone(),
            tag: release.tag.clone(),
            requires_core: release.requires_core.clone(),
            installed_pending_migrations,
            installed_pending_seeders,
            changelog: release.release_notes.clone(),
            published_at: release.published_at,
            has_checksum: release.checksum_url.is_some(),
        })
    }

    /// Modules whose latest release is newer than the installed version.
    ///
    /// A failed lookup for one module only drops that module from the list.
    pub async fn check_updates(&self) -> Result<Vec<AvailableUpdate>, UpdateError> {
        let modules: Vec<Module> = self
            .registry
            .list()
            .await?
            .into_iter()
            .filter(|m| m.repository.is_some())
            .collect();
        let repositories: Vec<_> = modules.iter().filter_map(|m| m.repository.clone()).collect();
        let releases = self.source.batch_latest_releases(&repositories).await;
        let core = &self.registry.environment().core_version;

        let mut available = Vec::new();
        for module in modules {
            let Some(repository) = &module.repository else {
                continue;
            };
            let Some(Some(release)) = releases.get(repository) else {
                continue;
            };
            if release.version > module.version {
                available.push(AvailableUpdate {
                    is_major: release.is_major_upgrade_from(&module.version),
                    core_compatible: release.is_compatible_with(core),
                    module: module.name.clone(),
                    installed: module.version.clone(),
                    release: release.clone(),
                });
            }
        }
        info!(count = available.len(), "Update check complete");
        Ok(available)
    }

    pub async fn history(&self, name: &str) -> Result<Vec<UpdateRecord>, UpdateError> {
        self.history.list_for_module(name).await
    }

    pub fn is_update_in_progress(&self, name: &str) -> bool {
        self.locks.is_locked(name)
    }

    /// Live status of the running update of `name`, if any.
    pub fn update_status(&self, name: &str) -> Option<UpdateStatus> {
        self.locks.status_of(name)
    }

    /// Ask the running update of `name` to stop.
    ///
    /// Accepted only before the backup starts; the update then ends
    /// `Failed` at its next phase boundary.
    pub fn cancel_update(&self, name: &str) -> Result<UpdateStatus, UpdateError> {
        self.locks.request_cancel(name)
    }

    pub fn list_backups(&self, name: &str) -> Result<Vec<BackupInfo>, UpdateError> {
        self.backups.list_backups(name)
    }

    // ========================================================================
    // Update pipeline
    // ========================================================================

    /// Update `name` to its latest release.
    ///
    /// # Errors
    ///
    /// * `LockAcquisitionFailed` if an update of `name` is already running
    /// * a pipeline error if the update failed before the backup existed
    /// * `RolledBack` if it failed afterwards and the backup was restored
    /// * `RollbackFailed` if restoring the backup failed as well
    pub async fn update(&self, name: &str) -> Result<UpdateOutcome, UpdateError> {
        let guard = self.locks.try_acquire(name)?;
        let module = self.registry.find(name).await?;

        let mut record = UpdateRecord::new(name, module.version.clone());
        self.history.append(record.clone()).await?;
        info!(module = name, from = %module.version, id = %record.id, "Update started");

        let staging = StagingDir {
            path: self.config.staging_dir().join(format!("{name}-{}", record.id)),
        };

        // Nothing on disk changes until the backup exists.
        let (release, artifact) =
            match self.prepare(&guard, &module, &mut record, &staging.path).await {
                Ok(prepared) => prepared,
                Err(e) => return Err(self.fail(&mut record, e).await),
            };

        if let Err(e) = self.enter(&guard, &mut record, UpdateStatus::BackingUp, true).await {
            return Err(self.fail(&mut record, e).await);
        }
        let (backup, pin) = match self.create_backup(&module).await {
            Ok(created) => created,
            Err(e) => return Err(self.fail(&mut record, e).await),
        };
        record.backup_path = Some(backup.path.clone());
        self.persist(&record).await;

        let mut attempted = AttemptedSteps::default();
        let warnings = match self
            .apply(&guard, &module, &release, &artifact, &mut record, &mut attempted)
            .await
        {
            Ok(warnings) => warnings,
            Err(cause) => {
                return Err(self.roll_back(&module, &backup, &attempted, &mut record, cause).await)
            }
        };

        if let Err(e) = record.finish(UpdateStatus::Completed, None) {
            error!(module = name, error = %e, "Could not mark update completed");
        }
        self.persist(&record).await;

        match self.backups.cleanup_old_backups(name) {
            Ok(0) => {}
            Ok(deleted) => debug!(module = name, deleted, "Old backups removed"),
            Err(e) => warn!(module = name, error = %e, "Backup cleanup failed"),
        }
        drop(pin);
        drop(staging);
        drop(guard);

        info!(module = name, from = %module.version, to = %release.version, "Update completed");
        self.registry.events().publish(ModuleEvent::UpdateCompleted {
            module: name.to_string(),
            from: module.version.clone(),
            to: release.version.clone(),
        });

        Ok(UpdateOutcome {
            record,
            backup,
            warnings,
        })
    }

    /// Resolve, download and verify the release.
    async fn prepare(
        &self,
        guard: &UpdateGuard,
        module: &Module,
        record: &mut UpdateRecord,
        staging: &Path,
    ) -> Result<(ReleaseInfo, PathBuf), UpdateError> {
        self.enter(guard, record, UpdateStatus::Downloading, true).await?;
        let release = self.resolve_release(module).await?;

        let core = &self.registry.environment().core_version;
        if !release.is_compatible_with(core) {
            return Err(UpdateError::CoreIncompatible {
                module: module.name.clone(),
                version: release.version.to_string(),
                constraint: release
                    .requires_core
                    .as_ref()
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
                core: core.to_string(),
            });
        }
        if release.download_url.is_none() {
            return Err(UpdateError::NoDownloadableAssets {
                module: module.name.clone(),
                tag: release.tag.clone(),
            });
        }
        record.to_version = Some(release.version.clone());
        self.persist(record).await;

        tokio::fs::create_dir_all(staging).await?;
        let artifact = with_timeout(
            self.config.network.download_timeout(),
            self.source.download_release(&release, staging, self.progress.clone()),
        )
        .await
        .map_err(|reason| download_failed(&module.name, reason))?
        .map_err(|e| download_failed(&module.name, e.to_string()))?;
        info!(module = %module.name, artifact = %artifact.display(), "Artifact downloaded");

        self.enter(guard, record, UpdateStatus::Verifying, true).await?;
        self.verify(module, &release, &artifact).await?;

        Ok((release, artifact))
    }

    /// Latest release of `module`, if it is newer than what is installed.
    async fn resolve_release(&self, module: &Module) -> Result<ReleaseInfo, UpdateError> {
        let repository = module
            .repository
            .as_ref()
            .ok_or_else(|| UpdateError::NoSourceConfigured {
                module: module.name.clone(),
            })?;

        let latest = with_timeout(
            self.config.network.timeout(),
            self.source.latest_release(repository),
        )
        .await
        .map_err(|reason| download_failed(&module.name, reason))?
        .map_err(|e| download_failed(&module.name, e.to_string()))?;

        let release = match latest {
            Some(release) if release.version > module.version => release,
            _ => {
                return Err(UpdateError::NoUpdateAvailable {
                    module: module.name.clone(),
                })
            }
        };
        Ok(release)
    }

    async fn verify(&self, module: &Module, release: &ReleaseInfo, artifact: &Path) -> Result<(), UpdateError> {
        let mismatch = |reason: String| UpdateError::ChecksumMismatch {
            module: module.name.clone(),
            reason,
        };

        let expected = with_timeout(
            self.config.network.timeout(),
            self.source.fetch_checksum(release),
        )
        .await
        .map_err(&mismatch)?
        .map_err(|e| mismatch(e.to_string()))?;

        let Some(expected) = expected else {
            if self.config.require_checksum {
                return Err(mismatch("release publishes no checksum".to_string()));
            }
            warn!(module = %module.name, tag = %release.tag, "Release publishes no checksum; skipping verification");
            return Ok(());
        };

        let path = artifact.to_path_buf();
        let matches = tokio::task::spawn_blocking(move || checksum::verify_file(&path, &expected))
            .await
            .map_err(|e| mismatch(format!("verification task failed: {e}")))??;
        if !matches {
            return Err(mismatch(format!(
                "sha256 of {} does not match the published checksum",
                release.artifact_file_name()
            )));
        }
        info!(module = %module.name, "Artifact checksum verified");
        Ok(())
    }

    async fn create_backup(&self, module: &Module) -> Result<(BackupInfo, BackupPin), UpdateError> {
        let backups = self.backups.clone();
        let snapshot = module.clone();
        tokio::task::spawn_blocking(move || backups.create_pinned_backup(&snapshot))
            .await
            .map_err(|e| UpdateError::BackupFailed {
                module: module.name.clone(),
                reason: format!("backup task failed: {e}"),
            })?
    }

    /// Replace files, migrate, seed, health-check and record the new version.
    ///
    /// Returns the health check warnings.
    async fn apply(
        &self,
        guard: &UpdateGuard,
        module: &Module,
        release: &ReleaseInfo,
        artifact: &Path,
        record: &mut UpdateRecord,
        attempted: &mut AttemptedSteps,
    ) -> Result<Vec<String>, UpdateError> {
        self.enter(guard, record, UpdateStatus::Applying, false).await?;
        let manifest = self.installer.install(module, artifact).await?;
        if manifest.version != release.version {
            return Err(UpdateError::ExtractionFailed {
                module: module.name.clone(),
                reason: format!(
                    "archive manifest declares {}, release is {}",
                    manifest.version, release.version
                ),
            });
        }
        let mut updated = module.clone();
        updated.refresh_from_manifest(manifest);

        self.enter(guard, record, UpdateStatus::Migrating, false).await?;
        attempted.migrations = self.migrations.pending_migrations(&updated).await?;
        attempted.seeders = self.migrations.pending_seeders(&updated).await?;
        record.migrations_run = self.migrations.run_migrations(&updated).await?;
        self.persist(record).await;

        self.enter(guard, record, UpdateStatus::Seeding, false).await?;
        record.seeders_run = self.migrations.run_seeders(&updated).await?;
        self.persist(record).await;

        self.enter(guard, record, UpdateStatus::HealthChecking, false).await?;
        let result = self.health.check(&updated).await.into_result(&module.name)?;

        self.registry.record_version(&module.name, &release.version).await?;
        Ok(result.warnings)
    }

    /// Restore the backup after a failure past the backup point and mark the
    /// attempt's migrations and seeders as not run.
    async fn roll_back(
        &self,
        module: &Module,
        backup: &BackupInfo,
        attempted: &AttemptedSteps,
        record: &mut UpdateRecord,
        cause: UpdateError,
    ) -> UpdateError {
        warn!(
            module = %module.name,
            phase = %record.status(),
            error = %cause,
            backup = %backup.path.display(),
            "Update failed, rolling back"
        );

        let restored = match self.restore(module, &backup.path).await {
            Ok(restored) => self
                .migrations
                .forget(module, &attempted.migrations, &attempted.seeders)
                .await
                .map(|()| restored),
            Err(e) => Err(e),
        };

        match restored {
            Ok(restored) => {
                if let Err(e) = record.finish(UpdateStatus::RolledBack, Some(cause.to_string())) {
                    error!(module = %module.name, error = %e, "Could not mark update rolled back");
                }
                self.persist(record).await;
                warn!(module = %module.name, restored = %restored.version, "Update rolled back");
                self.registry.events().publish(ModuleEvent::UpdateRolledBack {
                    module: module.name.clone(),
                    restored: restored.version.clone(),
                    error: cause.to_string(),
                });
                UpdateError::RolledBack {
                    module: module.name.clone(),
                    cause: Box::new(cause),
                }
            }
            Err(rollback_error) => {
                let err = UpdateError::RollbackFailed {
                    module: module.name.clone(),
                    cause: Box::new(cause),
                    reason: rollback_error.to_string(),
                };
                error!(module = %module.name, error = %err, "Rollback failed");
                if let Err(e) = record.finish(UpdateStatus::Failed, Some(err.to_string())) {
                    error!(module = %module.name, error = %e, "Could not mark update failed");
                }
                self.persist(record).await;
                self.registry.events().publish(ModuleEvent::UpdateFailed {
                    module: module.name.clone(),
                    error: err.to_string(),
                });
                err
            }
        }
    }

    /// End the attempt as `Failed` before anything on disk changed.
    async fn fail(&self, record: &mut UpdateRecord, err: UpdateError) -> UpdateError {
        let message = match &err {
            UpdateError::Cancelled { .. } => CANCELLED_MESSAGE.to_string(),
            other => other.to_string(),
        };
        warn!(module = %record.module, phase = %record.status(), error = %message, "Update failed");
        if let Err(e) = record.finish(UpdateStatus::Failed, Some(message.clone())) {
            error!(module = %record.module, error = %e, "Could not mark update failed");
        }
        self.persist(record).await;
        self.registry.events().publish(ModuleEvent::UpdateFailed {
            module: record.module.clone(),
            error: message,
        });
        err
    }

    /// Move the lock slot and the record to `next`.
    ///
    /// With `cancellable`, a pending cancel request stops the update here.
    async fn enter(
        &self,
        guard: &UpdateGuard,
        record: &mut UpdateRecord,
        next: UpdateStatus,
        cancellable: bool,
    ) -> Result<(), UpdateError> {
        if cancellable {
            guard.checkpoint(next)?;
        } else {
            guard.set_status(next);
        }
        record.advance(next)?;
        info!(module = %record.module, status = %next, "Update phase");
        self.persist(record).await;
        Ok(())
    }

    async fn persist(&self, record: &UpdateRecord) {
        if let Err(e) = self.history.save(record.clone()).await {
            warn!(module = %record.module, id = %record.id, error = %e, "Failed to save update record");
        }
    }

    // ========================================================================
    // Manual operations
    // ========================================================================

    /// Restore `name` from the backup at `backup_path`.
    ///
    /// Holds the update lock, so it cannot run during an update.
    pub async fn rollback(&self, name: &str, backup_path: &Path) -> Result<Module, UpdateError> {
        let _guard = self.locks.try_acquire(name)?;
        let module = self.registry.find(name).await?;
        let info = self.restore(&module, backup_path).await?;
        let module = self.registry.sync_from_disk(name).await?;

        info!(module = name, version = %info.version, "Module restored from backup");
        self.registry.events().publish(ModuleEvent::Restored {
            module: name.to_string(),
            version: module.version.clone(),
        });
        Ok(module)
    }

    async fn restore(&self, module: &Module, path: &Path) -> Result<BackupInfo, UpdateError> {
        let backups = self.backups.clone();
        let module = module.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || backups.restore_backup(&module, &path))
            .await
            .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?
    }

    /// Run the pending migrations of an installed module, then its seeders
    /// when `seed` is set.
    pub async fn migrate(&self, name: &str, seed: bool) -> Result<(Vec<String>, Vec<String>), UpdateError> {
        let _guard = self.locks.try_acquire(name)?;
        let module = self.registry.find(name).await?;
        let migrations = self.migrations.run_migrations(&module).await?;
        let seeders = if seed {
            self.migrations.run_seeders(&module).await?
        } else {
            Vec::new()
        };
        info!(module = name, migrations = migrations.len(), seeders = seeders.len(), "Migrations run");
        Ok((migrations, seeders))
    }
}

fn download_failed(module: &str, reason: String) -> UpdateError {
    UpdateError::DownloadFailed {
        module: module.to_string(),
        reason,
    }
}

/// Run `fut` with a deadline; the error is a human-readable reason.
async fn with_timeout<F: Future>(limit: Duration, fut: F) -> Result<F::Output, String> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| format!("timed out after {}s", limit.as_secs()))
}
