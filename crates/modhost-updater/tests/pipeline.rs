//! Integration tests for the module update pipeline.
//!
//! These tests drive `UpdateOrchestrator` against a real module directory
//! with an in-memory release source, covering:
//! - Successful updates, history and retention
//! - Failures before the backup point (nothing on disk changes)
//! - Failures after the backup point (automatic rollback)
//! - Locking, preview and cancellation while an update runs

mod support;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use modhost_core::{Module, ModuleEvent, ModuleManifest};
use modhost_updater::{
    ArchiveInstaller, HistoryStore, JsonFileHistoryStore, MigrationRunner, ModuleInstaller, UpdateError,
    UpdateStatus,
};
use support::{module_archive, FakeSource, Host, ScriptedRuntime};

// =============================================================================
// Test doubles
// =============================================================================

/// Reports and "runs" a fixed list of migrations, or fails.
struct ScriptedMigrations {
    migrations: Vec<String>,
    fail: bool,
    forgotten: std::sync::Mutex<Vec<String>>,
}

impl ScriptedMigrations {
    fn ok(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            migrations: names.iter().map(|n| n.to_string()).collect(),
            fail: false,
            forgotten: Default::default(),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            migrations: vec!["2024_05_01_add_slug".into()],
            fail: true,
            forgotten: Default::default(),
        })
    }
}

#[async_trait]
impl MigrationRunner for ScriptedMigrations {
    async fn pending_migrations(&self, _module: &Module) -> Result<Vec<String>, UpdateError> {
        Ok(self.migrations.clone())
    }

    async fn pending_seeders(&self, _module: &Module) -> Result<Vec<String>, UpdateError> {
        Ok(Vec::new())
    }

    async fn run_migrations(&self, module: &Module) -> Result<Vec<String>, UpdateError> {
        if self.fail {
            return Err(UpdateError::MigrationFailed {
                module: module.name.clone(),
                reason: "column slug already exists".into(),
            });
        }
        Ok(self.migrations.clone())
    }

    async fn run_seeders(&self, _module: &Module) -> Result<Vec<String>, UpdateError> {
        Ok(Vec::new())
    }

    async fn forget(&self, _module: &Module, migrations: &[String], _seeders: &[String]) -> Result<(), UpdateError> {
        self.forgotten.lock().unwrap().extend_from_slice(migrations);
        Ok(())
    }
}

/// Waits for a go signal before installing.
struct GatedInstaller {
    started: Arc<Notify>,
    gate: Arc<Notify>,
}

#[async_trait]
impl ModuleInstaller for GatedInstaller {
    async fn install(&self, module: &Module, artifact: &Path) -> Result<ModuleManifest, UpdateError> {
        self.started.notify_one();
        self.gate.notified().await;
        ArchiveInstaller::new().install(module, artifact).await
    }
}

/// Damages every stored backup, then fails.
struct SabotageInstaller {
    backup_root: PathBuf,
}

#[async_trait]
impl ModuleInstaller for SabotageInstaller {
    async fn install(&self, module: &Module, _artifact: &Path) -> Result<ModuleManifest, UpdateError> {
        for backup in fs::read_dir(self.backup_root.join(&module.name)).unwrap() {
            let view = backup.unwrap().path().join("files/views/index.html");
            fs::write(view, "tampered").unwrap();
        }
        Err(UpdateError::ExtractionFailed {
            module: module.name.clone(),
            reason: "disk full".into(),
        })
    }
}

async fn wait_for(notify: &Notify) {
    tokio::time::timeout(Duration::from_secs(10), notify.notified())
        .await
        .expect("pipeline did not reach the expected phase");
}

// =============================================================================
// Successful updates
// =============================================================================

/// Test: A healthy update replaces files, records the version and keeps a backup
#[tokio::test]
async fn integration_update_completes() {
    let host = Host::new().await;
    let source = FakeSource::new();
    source.publish("blog", "1.1.0");

    let progress_calls = Arc::new(AtomicUsize::new(0));
    let calls = progress_calls.clone();
    let orchestrator = host
        .orchestrator(source.clone())
        .with_migrations(ScriptedMigrations::ok(&["2024_05_01_add_slug"]))
        .with_progress(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        });

    let outcome = orchestrator.update("blog").await.unwrap();

    assert_eq!(outcome.record.status(), UpdateStatus::Completed);
    assert_eq!(outcome.record.to_version.as_ref().unwrap().to_string(), "1.1.0");
    assert_eq!(outcome.record.migrations_run, vec!["2024_05_01_add_slug"]);
    assert!(outcome.record.finished_at.is_some());
    assert_eq!(outcome.backup.version.to_string(), "1.0.0");
    assert_eq!(outcome.record.backup_path.as_ref(), Some(&outcome.backup.path));

    assert_eq!(host.installed_version("blog"), "1.1.0");
    assert_eq!(host.registered_version("blog").await, "1.1.0");
    assert!(!host.module_dir("blog").join("config.local.php").exists());
    assert!(progress_calls.load(Ordering::SeqCst) > 0);
    assert_eq!(host.staging_leftovers(), 0);
    assert!(!orchestrator.is_update_in_progress("blog"));

    assert!(host.events().iter().any(|e| matches!(
        e,
        ModuleEvent::UpdateCompleted { module, from, to }
            if module == "blog" && from.to_string() == "1.0.0" && to.to_string() == "1.1.0"
    )));

    let history = orchestrator.history("blog").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status(), UpdateStatus::Completed);
}

/// Test: History written to a file survives a new orchestrator
#[tokio::test]
async fn integration_history_persists() {
    let host = Host::new().await;
    let source = FakeSource::new();
    source.publish("blog", "1.1.0");
    let path = host.temp.path().join("state/update-history.json");

    host.orchestrator(source.clone())
        .with_history(Arc::new(JsonFileHistoryStore::new(&path)))
        .update("blog")
        .await
        .unwrap();

    let records = JsonFileHistoryStore::new(&path).list_for_module("blog").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status(), UpdateStatus::Completed);
    assert_eq!(records[0].from_version.to_string(), "1.0.0");
}

/// Test: Only the newest backups are kept across repeated updates
#[tokio::test]
async fn integration_backup_retention() {
    let mut host = Host::new().await;
    host.config.rollback.max_backups = 2;
    let source = FakeSource::new();
    let orchestrator = host.orchestrator(source.clone());

    for version in ["1.1.0", "1.2.0", "1.3.0", "1.4.0"] {
        source.publish("blog", version);
        orchestrator.update("blog").await.unwrap();
    }

    let versions: Vec<String> = orchestrator
        .list_backups("blog")
        .unwrap()
        .iter()
        .map(|b| b.version.to_string())
        .collect();
    assert_eq!(versions, vec!["1.3.0", "1.2.0"]);
    assert_eq!(host.registered_version("blog").await, "1.4.0");
}

/// Test: Manually restoring a backup brings the old version back
#[tokio::test]
async fn integration_manual_rollback() {
    let host = Host::new().await;
    let source = FakeSource::new();
    source.publish("blog", "1.1.0");
    let orchestrator = host.orchestrator(source.clone());

    let outcome = orchestrator.update("blog").await.unwrap();
    let module = orchestrator.rollback("blog", &outcome.backup.path).await.unwrap();

    assert_eq!(module.version.to_string(), "1.0.0");
    assert_eq!(host.installed_version("blog"), "1.0.0");
    assert!(host.module_dir("blog").join("config.local.php").exists());
    assert!(host
        .events()
        .iter()
        .any(|e| matches!(e, ModuleEvent::Restored { module, .. } if module == "blog")));
}

// =============================================================================
// Failures before the backup point
// =============================================================================

/// Test: A checksum mismatch fails without backing up or extracting
#[tokio::test]
async fn integration_checksum_mismatch_changes_nothing() {
    let host = Host::new().await;
    let source = FakeSource::new();
    source.publish_with(
        "blog",
        "1.1.0",
        module_archive("blog", "1.1.0"),
        Some("0".repeat(64)),
        None,
    );
    let orchestrator = host.orchestrator(source.clone());

    let err = orchestrator.update("blog").await.unwrap_err();

    assert!(matches!(err, UpdateError::ChecksumMismatch { .. }), "got {err:?}");
    assert_eq!(host.installed_version("blog"), "1.0.0");
    assert!(host.module_dir("blog").join("config.local.php").exists());
    assert!(orchestrator.list_backups("blog").unwrap().is_empty());
    assert_eq!(host.staging_leftovers(), 0);

    let history = orchestrator.history("blog").await.unwrap();
    assert_eq!(history[0].status(), UpdateStatus::Failed);
    assert!(history[0].backup_path.is_none());
    assert!(history[0].error.as_ref().unwrap().contains("checksum"));
}

/// Test: A release without a checksum is refused unless checksums are optional
#[tokio::test]
async fn integration_missing_checksum_policy() {
    let mut host = Host::new().await;
    let source = FakeSource::new();
    source.publish_with("blog", "1.1.0", module_archive("blog", "1.1.0"), None, None);

    let err = host.orchestrator(source.clone()).update("blog").await.unwrap_err();
    assert!(matches!(err, UpdateError::ChecksumMismatch { .. }));
    assert_eq!(host.installed_version("blog"), "1.0.0");

    host.config.require_checksum = false;
    host.orchestrator(source.clone()).update("blog").await.unwrap();
    assert_eq!(host.installed_version("blog"), "1.1.0");
}

/// Test: Nothing newer than the installed version is not an update
#[tokio::test]
async fn integration_no_update_available() {
    let host = Host::new().await;
    let source = FakeSource::new();
    source.publish("blog", "1.0.0");
    let orchestrator = host.orchestrator(source.clone());

    let err = orchestrator.update("blog").await.unwrap_err();
    assert!(matches!(err, UpdateError::NoUpdateAvailable { .. }));
    assert!(matches!(
        orchestrator.preview("blog").await,
        Err(UpdateError::NoUpdateAvailable { .. })
    ));
    assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
}

/// Test: A release requiring a newer core is refused before download
#[tokio::test]
async fn integration_core_incompatible_release() {
    let host = Host::new().await;
    let source = FakeSource::new();
    let artifact = module_archive("blog", "2.0.0");
    let checksum = support::sha256_hex(&artifact);
    source.publish_with(
        "blog",
        "2.0.0",
        artifact,
        Some(checksum),
        Some("## Changes\n\n- **Requires core:** `>=2.0.0`\n- New editor"),
    );
    let orchestrator = host.orchestrator(source.clone());

    let preview = orchestrator.preview("blog").await.unwrap();
    assert!(preview.is_major);
    assert!(!preview.core_compatible);
    assert_eq!(preview.requires_core.unwrap().to_string(), ">=2.0.0");

    let err = orchestrator.update("blog").await.unwrap_err();
    assert!(matches!(err, UpdateError::CoreIncompatible { .. }), "got {err:?}");
    assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
    assert_eq!(host.installed_version("blog"), "1.0.0");
}

// =============================================================================
// Failures after the backup point
// =============================================================================

/// Test: A failing health check restores the previous files
#[tokio::test]
async fn integration_health_failure_rolls_back() {
    let host = Host::new().await;
    let source = FakeSource::new();
    source.publish("blog", "1.1.0");
    let orchestrator = host
        .orchestrator(source.clone())
        .with_health_checker(ScriptedRuntime::broken_provider());

    let err = orchestrator.update("blog").await.unwrap_err();

    assert!(matches!(err, UpdateError::RolledBack { .. }), "got {err:?}");
    assert!(matches!(err.root_cause(), UpdateError::HealthCheckFailed { .. }));
    assert_eq!(host.installed_version("blog"), "1.0.0");
    assert_eq!(host.registered_version("blog").await, "1.0.0");
    assert!(host.module_dir("blog").join("config.local.php").exists());

    let record = &orchestrator.history("blog").await.unwrap()[0];
    assert_eq!(record.status(), UpdateStatus::RolledBack);
    assert!(record.backup_path.is_some());
    assert!(record.error.as_ref().unwrap().contains("provider class not found"));

    assert!(host.events().iter().any(|e| matches!(
        e,
        ModuleEvent::UpdateRolledBack { module, restored, .. }
            if module == "blog" && restored.to_string() == "1.0.0"
    )));
}

/// Test: A failing migration restores the previous files
#[tokio::test]
async fn integration_migration_failure_rolls_back() {
    let host = Host::new().await;
    let source = FakeSource::new();
    source.publish("blog", "1.1.0");
    let migrations = ScriptedMigrations::failing();
    let orchestrator = host.orchestrator(source.clone()).with_migrations(migrations.clone());

    let err = orchestrator.update("blog").await.unwrap_err();

    assert!(matches!(err.root_cause(), UpdateError::MigrationFailed { .. }));
    assert_eq!(*migrations.forgotten.lock().unwrap(), vec!["2024_05_01_add_slug"]);
    assert_eq!(host.installed_version("blog"), "1.0.0");
    assert_eq!(
        fs::read_to_string(host.module_dir("blog").join("views/index.html")).unwrap(),
        "<h1>blog 1.0.0</h1>"
    );
}

/// Test: Migrations run by a rolled back update run again on the next attempt
#[cfg(unix)]
#[tokio::test]
async fn integration_rolled_back_migrations_rerun() {
    let host = Host::new().await;
    let source = FakeSource::new();
    let manifest = support::manifest_json("blog", "1.1.0");
    let artifact = support::zip_bytes(&[
        (modhost_core::MANIFEST_FILE, manifest.as_str()),
        ("views/index.html", "<h1>blog 1.1.0</h1>"),
        ("database/migrations/002_add_slug.sql", "ALTER TABLE posts ADD slug TEXT;"),
    ]);
    let checksum = Some(support::sha256_hex(&artifact));
    source.publish_with("blog", "1.1.0", artifact, checksum, None);

    let runner = Arc::new(
        modhost_updater::CommandMigrationRunner::new(host.temp.path().join("migrations.json"))
            .with_migrate_command("true {file}"),
    );

    // The installed files carry no steps; the release's migration is not known yet
    let preview = host
        .orchestrator(source.clone())
        .with_migrations(runner.clone())
        .preview("blog")
        .await
        .unwrap();
    assert!(preview.installed_pending_migrations.is_empty());

    let err = host
        .orchestrator(source.clone())
        .with_migrations(runner.clone())
        .with_health_checker(ScriptedRuntime::broken_provider())
        .update("blog")
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::RolledBack { .. }), "got {err:?}");

    let outcome = host
        .orchestrator(source.clone())
        .with_migrations(runner.clone())
        .update("blog")
        .await
        .unwrap();
    assert_eq!(outcome.record.migrations_run, vec!["002_add_slug.sql"]);
    assert_eq!(host.installed_version("blog"), "1.1.0");
}

/// Test: A corrupted backup turns a failed update into a rollback failure
#[tokio::test]
async fn integration_rollback_failure_is_reported() {
    let host = Host::new().await;
    let source = FakeSource::new();
    source.publish("blog", "1.1.0");
    let orchestrator = host
        .orchestrator(source.clone())
        .with_installer(Arc::new(SabotageInstaller {
            backup_root: host.config.rollback.backup_dir(),
        }));

    let err = orchestrator.update("blog").await.unwrap_err();

    assert!(matches!(err, UpdateError::RollbackFailed { .. }), "got {err:?}");
    assert!(matches!(err.root_cause(), UpdateError::ExtractionFailed { .. }));

    let record = &orchestrator.history("blog").await.unwrap()[0];
    assert_eq!(record.status(), UpdateStatus::Failed);
    assert!(record.error.as_ref().unwrap().contains("manual intervention"));
    assert!(host
        .events()
        .iter()
        .any(|e| matches!(e, ModuleEvent::UpdateFailed { module, .. } if module == "blog")));
}

// =============================================================================
// Concurrency and cancellation
// =============================================================================

/// Test: A second update of the same module fails fast; preview still works
#[tokio::test]
async fn integration_concurrent_update_rejected() {
    let host = Host::new().await;
    let source = FakeSource::new();
    source.publish("blog", "1.1.0");
    let gate = source.hold_downloads();
    let orchestrator = Arc::new(host.orchestrator(source.clone()));

    let running = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.update("blog").await }
    });
    wait_for(&source.download_started).await;

    assert!(orchestrator.is_update_in_progress("blog"));
    assert_eq!(orchestrator.update_status("blog"), Some(UpdateStatus::Downloading));
    assert!(matches!(
        orchestrator.update("blog").await,
        Err(UpdateError::LockAcquisitionFailed { .. })
    ));

    let preview = orchestrator.preview("blog").await.unwrap();
    assert_eq!(preview.from_version.to_string(), "1.0.0");
    assert_eq!(preview.to_version.to_string(), "1.1.0");
    assert!(preview.has_checksum);

    gate.notify_one();
    running.await.unwrap().unwrap();
    assert!(!orchestrator.is_update_in_progress("blog"));
    assert_eq!(orchestrator.history("blog").await.unwrap().len(), 1);
}

/// Test: Cancelling during download ends the update as failed, untouched
#[tokio::test]
async fn integration_cancel_during_download() {
    let host = Host::new().await;
    let source = FakeSource::new();
    source.publish("blog", "1.1.0");
    let gate = source.hold_downloads();
    let orchestrator = Arc::new(host.orchestrator(source.clone()));

    let running = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.update("blog").await }
    });
    wait_for(&source.download_started).await;

    assert_eq!(orchestrator.cancel_update("blog").unwrap(), UpdateStatus::Downloading);
    gate.notify_one();

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, UpdateError::Cancelled { .. }), "got {err:?}");
    assert_eq!(host.installed_version("blog"), "1.0.0");
    assert!(orchestrator.list_backups("blog").unwrap().is_empty());

    let record = &orchestrator.history("blog").await.unwrap()[0];
    assert_eq!(record.status(), UpdateStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("update cancelled"));
    assert!(matches!(
        orchestrator.cancel_update("blog"),
        Err(UpdateError::NoUpdateInProgress { .. })
    ));
}

/// Test: Once files are being replaced a cancel request is refused
#[tokio::test]
async fn integration_cancel_refused_while_applying() {
    let host = Host::new().await;
    let source = FakeSource::new();
    source.publish("blog", "1.1.0");
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let orchestrator = Arc::new(host.orchestrator(source.clone()).with_installer(Arc::new(GatedInstaller {
        started: started.clone(),
        gate: gate.clone(),
    })));

    let running = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.update("blog").await }
    });
    wait_for(&started).await;

    match orchestrator.cancel_update("blog") {
        Err(UpdateError::CancellationRefused { status, .. }) => assert_eq!(status, UpdateStatus::Applying),
        other => panic!("expected CancellationRefused, got {other:?}"),
    }

    gate.notify_one();
    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.record.status(), UpdateStatus::Completed);
    assert_eq!(host.installed_version("blog"), "1.1.0");
}

// =============================================================================
// Update checks
// =============================================================================

/// Test: Only modules with a newer release are reported
#[tokio::test]
async fn integration_check_updates() {
    let host = Host::new().await;
    host.install("media", "2.0.0");
    host.install("notes", "0.3.0");
    host.registry.discover(&host.modules_dir()).await.unwrap();

    let source = FakeSource::new();
    source.publish("blog", "1.2.0");
    source.publish("notes", "0.3.0");

    let available = host.orchestrator(source.clone()).check_updates().await.unwrap();

    assert_eq!(available.len(), 1);
    assert_eq!(available[0].module, "blog");
    assert_eq!(available[0].installed.to_string(), "1.0.0");
    assert_eq!(available[0].release.version.to_string(), "1.2.0");
    assert!(!available[0].is_major);
    assert!(available[0].core_compatible);
}
