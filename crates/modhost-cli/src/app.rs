//! Wiring of the registry and update pipeline from configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use modhost_core::{Environment, EventBus, JsonFileModuleStore, LoggingListener, ModuleRegistry};
use modhost_updater::{
    BackupManager, CommandMigrationRunner, GitHubReleaseSource, JsonFileHistoryStore, ProgressCallback,
    UpdateConfig, UpdateOrchestrator,
};
use tracing::debug;

use crate::config::Config;

const MODULES_FILE: &str = "modules.json";
const HISTORY_FILE: &str = "update-history.json";
const LEDGER_FILE: &str = "migrations.json";

/// Registry and orchestrator backed by files in the state directory.
pub struct App {
    pub registry: Arc<ModuleRegistry>,
    pub orchestrator: UpdateOrchestrator,
    modules_dir: PathBuf,
    state_dir: PathBuf,
}

impl App {
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        Self::open_with_progress(config, None)
    }

    /// Like [`App::open`], reporting artifact download progress to `progress`.
    pub fn open_with_progress(config: &Config, progress: Option<ProgressCallback>) -> anyhow::Result<Self> {
        let state_dir = config.paths.state_dir();
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Could not create state directory {}", state_dir.display()))?;
        debug!(state_dir = %state_dir.display(), modules_dir = %config.paths.modules_dir.display(), "Opening registry");

        let environment = Environment::new(config.core_version()?)
            .with_extensions(config.environment.extensions.iter().cloned());
        let events = Arc::new(EventBus::new());
        events.subscribe(Arc::new(LoggingListener));

        let store = Arc::new(JsonFileModuleStore::new(state_dir.join(MODULES_FILE)));
        let registry = Arc::new(ModuleRegistry::new(store, environment, events));

        let update = resolve_update_config(&config.update, &state_dir);
        let source = Arc::new(GitHubReleaseSource::new(&update)?);
        let backups = BackupManager::new(update.rollback.backup_dir(), update.rollback.max_backups);

        let mut migrations = CommandMigrationRunner::new(state_dir.join(LEDGER_FILE))
            .with_timeout(Duration::from_secs(config.migrations.timeout_seconds));
        if let Some(command) = &config.migrations.migrate_command {
            migrations = migrations.with_migrate_command(command.clone());
        }
        if let Some(command) = &config.migrations.seed_command {
            migrations = migrations.with_seed_command(command.clone());
        }

        let mut orchestrator = UpdateOrchestrator::new(registry.clone(), source, backups, update)?
            .with_migrations(Arc::new(migrations))
            .with_history(Arc::new(JsonFileHistoryStore::new(state_dir.join(HISTORY_FILE))));
        if let Some(progress) = progress {
            orchestrator = orchestrator.with_progress(move |p| progress(p));
        }

        Ok(Self {
            registry,
            orchestrator,
            modules_dir: config.paths.modules_dir.clone(),
            state_dir,
        })
    }

    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

/// Place backups and staging under the state directory unless configured.
fn resolve_update_config(config: &UpdateConfig, state_dir: &Path) -> UpdateConfig {
    let mut update = config.clone();
    if update.rollback.backup_dir.is_none() {
        update.rollback.backup_dir = Some(state_dir.join("backups"));
    }
    if update.staging_dir.is_none() {
        update.staging_dir = Some(state_dir.join("staging"));
    }
    update
}
