//! Schema migrations and seeders shipped with modules.
//!
//! A module keeps migrations in `database/migrations/` and seeders in
//! `database/seeders/`; each file is one step, run in file-name order. What
//! has already run is kept in a ledger so every step runs once.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use modhost_core::store::write_atomic;
use modhost_core::Module;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::UpdateError;

const MIGRATIONS_DIR: &str = "database/migrations";
const SEEDERS_DIR: &str = "database/seeders";

/// Runs a module's migrations and seeders.
#[async_trait]
pub trait MigrationRunner: Send + Sync {
    /// Migrations of `module` that have not run yet, in run order.
    async fn pending_migrations(&self, module: &Module) -> Result<Vec<String>, UpdateError>;

    async fn pending_seeders(&self, module: &Module) -> Result<Vec<String>, UpdateError>;

    /// Run every pending migration and return the names that ran.
    ///
    /// Stops at the first failure with `MigrationFailed`.
    async fn run_migrations(&self, module: &Module) -> Result<Vec<String>, UpdateError>;

    async fn run_seeders(&self, module: &Module) -> Result<Vec<String>, UpdateError>;

    /// Mark steps of `module` as not run, so they run again next time.
    ///
    /// Names that were never recorded are ignored.
    async fn forget(&self, module: &Module, migrations: &[String], seeders: &[String]) -> Result<(), UpdateError>;
}

/// For installations whose modules carry no database steps.
#[derive(Debug, Default, Clone)]
pub struct NoopMigrationRunner;

#[async_trait]
impl MigrationRunner for NoopMigrationRunner {
    async fn pending_migrations(&self, _module: &Module) -> Result<Vec<String>, UpdateError> {
        Ok(Vec::new())
    }

    async fn pending_seeders(&self, _module: &Module) -> Result<Vec<String>, UpdateError> {
        Ok(Vec::new())
    }

    async fn run_migrations(&self, _module: &Module) -> Result<Vec<String>, UpdateError> {
        Ok(Vec::new())
    }

    async fn run_seeders(&self, _module: &Module) -> Result<Vec<String>, UpdateError> {
        Ok(Vec::new())
    }

    async fn forget(&self, _module: &Module, _migrations: &[String], _seeders: &[String]) -> Result<(), UpdateError> {
        Ok(())
    }
}

// ============================================================================
// Command Runner
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    Migration,
    Seeder,
}

impl StepKind {
    fn dir(self) -> &'static str {
        match self {
            StepKind::Migration => MIGRATIONS_DIR,
            StepKind::Seeder => SEEDERS_DIR,
        }
    }

    fn label(self) -> &'static str {
        match self {
            StepKind::Migration => "migration",
            StepKind::Seeder => "seeder",
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerEntry {
    #[serde(default)]
    migrations: BTreeSet<String>,
    #[serde(default)]
    seeders: BTreeSet<String>,
}

impl LedgerEntry {
    fn ran(&mut self, kind: StepKind) -> &mut BTreeSet<String> {
        match kind {
            StepKind::Migration => &mut self.migrations,
            StepKind::Seeder => &mut self.seeders,
        }
    }
}

/// Runs each step through an external command.
///
/// Command templates are split on whitespace; `{module}`, `{file}` and
/// `{name}` in any argument are replaced with the module name, the step's
/// absolute path and its file name. The command runs in the module
/// directory without a shell.
pub struct CommandMigrationRunner {
    ledger_path: PathBuf,
    migrate_command: Option<String>,
    seed_command: Option<String>,
    timeout: Duration,
    ledger: Mutex<()>,
}

impl CommandMigrationRunner {
    pub fn new(ledger_path: impl Into<PathBuf>) -> Self {
        Self {
            ledger_path: ledger_path.into(),
            migrate_command: None,
            seed_command: None,
            timeout: Duration::from_secs(300),
            ledger: Mutex::new(()),
        }
    }

    pub fn with_migrate_command(mut self, command: impl Into<String>) -> Self {
        self.migrate_command = Some(command.into());
        self
    }

    pub fn with_seed_command(mut self, command: impl Into<String>) -> Self {
        self.seed_command = Some(command.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn read_ledger(&self) -> Result<BTreeMap<String, LedgerEntry>, UpdateError> {
        match tokio::fs::read(&self.ledger_path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_ledger(&self, ledger: &BTreeMap<String, LedgerEntry>) -> Result<(), UpdateError> {
        let json = serde_json::to_vec_pretty(ledger)?;
        Ok(write_atomic(&self.ledger_path, &json).await?)
    }

    async fn pending(&self, module: &Module, kind: StepKind) -> Result<Vec<String>, UpdateError> {
        let available = list_steps(&module.path.join(kind.dir())).await?;
        let ledger = self.read_ledger().await?;
        let ran = ledger.get(&module.name);
        Ok(available
            .into_iter()
            .filter(|step| {
                !ran.is_some_and(|entry| match kind {
                    StepKind::Migration => entry.migrations.contains(step),
                    StepKind::Seeder => entry.seeders.contains(step),
                })
            })
            .collect())
    }

    async fn run(&self, module: &Module, kind: StepKind) -> Result<Vec<String>, UpdateError> {
        let _guard = self.ledger.lock().await;
        let pending = self.pending(module, kind).await?;
        if pending.is_empty() {
            debug!(module = %module.name, kind = kind.label(), "Nothing to run");
            return Ok(pending);
        }

        let template = match kind {
            StepKind::Migration => self.migrate_command.as_deref(),
            StepKind::Seeder => self.seed_command.as_deref(),
        }
        .ok_or_else(|| UpdateError::MigrationFailed {
            module: module.name.clone(),
            reason: format!(
                "{} pending {}(s) but no {} command is configured",
                pending.len(),
                kind.label(),
                kind.label()
            ),
        })?;

        let mut ran = Vec::new();
        for step in pending {
            let file = module.path.join(kind.dir()).join(&step);
            self.run_step(module, template, &file, &step).await?;
            info!(module = %module.name, step = %step, kind = kind.label(), "Step completed");

            let mut ledger = self.read_ledger().await?;
            ledger
                .entry(module.name.clone())
                .or_default()
                .ran(kind)
                .insert(step.clone());
            self.write_ledger(&ledger).await?;
            ran.push(step);
        }
        Ok(ran)
    }

    async fn forget_steps(&self, module: &Module, migrations: &[String], seeders: &[String]) -> Result<(), UpdateError> {
        if migrations.is_empty() && seeders.is_empty() {
            return Ok(());
        }
        let _guard = self.ledger.lock().await;
        let mut ledger = self.read_ledger().await?;
        let Some(entry) = ledger.get_mut(&module.name) else {
            return Ok(());
        };

        let mut removed = 0;
        for (kind, steps) in [(StepKind::Migration, migrations), (StepKind::Seeder, seeders)] {
            let ran = entry.ran(kind);
            removed += steps.iter().filter(|step| ran.remove(step.as_str())).count();
        }
        if removed == 0 {
            return Ok(());
        }
        if entry.migrations.is_empty() && entry.seeders.is_empty() {
            ledger.remove(&module.name);
        }
        self.write_ledger(&ledger).await?;
        info!(module = %module.name, removed, "Steps marked as not run");
        Ok(())
    }

    async fn run_step(
        &self,
        module: &Module,
        template: &str,
        file: &Path,
        step: &str,
    ) -> Result<(), UpdateError> {
        let failed = |reason: String| UpdateError::MigrationFailed {
            module: module.name.clone(),
            reason: format!("{step}: {reason}"),
        };

        let file_arg = file.to_string_lossy();
        let mut parts = template.split_whitespace().map(|part| {
            part.replace("{module}", &module.name)
                .replace("{file}", &file_arg)
                .replace("{name}", step)
        });
        let program = parts
            .next()
            .ok_or_else(|| failed("command template is empty".to_string()))?;

        let output = Command::new(&program)
            .args(parts)
            .current_dir(&module.path)
            .env("MODHOST_MODULE", &module.name)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| failed(format!("timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| failed(format!("failed to start {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim().lines().last().unwrap_or("").to_string();
            warn!(module = %module.name, step, status = %output.status, "Step failed");
            return Err(failed(format!("exited with {}: {}", output.status, detail)));
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationRunner for CommandMigrationRunner {
    async fn pending_migrations(&self, module: &Module) -> Result<Vec<String>, UpdateError> {
        self.pending(module, StepKind::Migration).await
    }

    async fn pending_seeders(&self, module: &Module) -> Result<Vec<String>, UpdateError> {
        self.pending(module, StepKind::Seeder).await
    }

    async fn run_migrations(&self, module: &Module) -> Result<Vec<String>, UpdateError> {
        self.run(module, StepKind::Migration).await
    }

    async fn run_seeders(&self, module: &Module) -> Result<Vec<String>, UpdateError> {
        self.run(module, StepKind::Seeder).await
    }

    async fn forget(&self, module: &Module, migrations: &[String], seeders: &[String]) -> Result<(), UpdateError> {
        self.forget_steps(module, migrations, seeders).await
    }
}

/// File names in `dir`, sorted. A missing directory has no steps.
async fn list_steps(dir: &Path) -> Result<Vec<String>, UpdateError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut steps = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                steps.push(name);
            }
        }
    }
    steps.sort();
    Ok(steps)
}
