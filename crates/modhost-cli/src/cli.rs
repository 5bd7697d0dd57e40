//! CLI command definitions and argument parsing

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use modhost_core::{CoreError, ModuleVersion};
use modhost_updater::{DownloadProgress, ProgressCallback, UpdateError};
use serde::Serialize;

use crate::app::App;
use crate::config::Config;
use crate::output::{OutputFormat, OutputFormatter, SuccessMessage};
use crate::ExitCode;

/// modhost - module lifecycle and self-update
#[derive(Parser, Debug)]
#[command(name = "modhost")]
#[command(version, about = "modhost - module lifecycle and self-update")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: table, json, quiet (default from config)
    #[arg(long, global = true)]
    pub output: Option<OutputFormat>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the installed modules
    #[arg(long, global = true, env = "MODHOST_MODULES_DIR")]
    pub modules_dir: Option<PathBuf>,

    /// Directory for registry state, history and backups
    #[arg(long, global = true, env = "MODHOST_STATE_DIR")]
    pub state_dir: Option<PathBuf>,
}

impl Cli {
    /// Execute the CLI command with a pre-loaded configuration
    ///
    /// Command errors are reported through the output formatter and turned
    /// into an exit code.
    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        let format = config.output.format.parse().unwrap_or_default();
        let formatter =
            OutputFormatter::new(format, config.output.verbose).with_colors(config.output.colors);

        let result = match self.command {
            Commands::Module(args) => args.execute(&config, &formatter).await,
            Commands::Config(args) => args.execute(&config, &formatter),
        };

        match result {
            Ok(code) => Ok(code),
            Err(e) => {
                let code = ExitCode::from_error(&e);
                formatter.report_error(&e, code);
                Ok(code)
            }
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage installed modules and their updates
    Module(ModuleArgs),
    /// Inspect the configuration
    Config(ConfigArgs),
}

/// Arguments for the module command
#[derive(Parser, Debug)]
pub struct ModuleArgs {
    #[command(subcommand)]
    pub action: ModuleAction,
}

/// Module subcommands
#[derive(Subcommand, Debug)]
pub enum ModuleAction {
    /// Scan the modules directory and register what is installed
    Discover,
    /// List registered modules
    List {
        /// Only show enabled modules
        #[arg(long)]
        enabled: bool,
    },
    /// Enable modules; several names are enabled together in dependency order
    Enable {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Disable modules; several names are disabled together, dependents first
    Disable {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Remove a disabled module from the registry
    Uninstall {
        name: String,
        /// Delete the module directory as well
        #[arg(long)]
        remove_files: bool,
    },
    /// Run pending migrations of a module
    Migrate {
        name: String,
        /// Run pending seeders after the migrations
        #[arg(long)]
        seed: bool,
    },
    /// Update a module to its latest release
    Update {
        name: String,
        /// Show what the update would do without changing anything
        #[arg(long)]
        preview: bool,
    },
    /// Restore a module from one of its backups
    Rollback {
        name: String,
        /// Backup version to restore (default: newest backup)
        #[arg(long, conflicts_with = "backup")]
        to: Option<String>,
        /// Backup directory to restore
        backup: Option<PathBuf>,
    },
    /// List the backups of a module, newest first
    Backups { name: String },
    /// Show the update history of a module, newest first
    History { name: String },
    /// Look up newer releases for every module with a repository
    CheckUpdates,
}

#[derive(Serialize)]
struct ChangedOutput<'a> {
    action: &'static str,
    modules: &'a [String],
}

#[derive(Serialize)]
struct MigrationOutput<'a> {
    module: &'a str,
    migrations: &'a [String],
    seeders: &'a [String],
}

impl ModuleArgs {
    pub async fn execute(self, config: &Config, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
        let reporter = OutputFormatter::new(formatter.format(), formatter.is_verbose());
        let progress: ProgressCallback = Arc::new(move |p: DownloadProgress| reporter.download_progress(p));
        let app = App::open_with_progress(config, Some(progress))?;

        match self.action {
            ModuleAction::Discover => {
                formatter.progress(&format!("Scanning {}...", app.modules_dir().display()));
                let report = app.registry.discover(app.modules_dir()).await?;
                emit(&formatter.format_discovery(&report));
                if !report.invalid.is_empty() {
                    formatter.warning(&format!("{} manifest(s) could not be read", report.invalid.len()));
                }
                Ok(ExitCode::Success)
            }
            ModuleAction::List { enabled } => {
                let mut modules = app.registry.list().await?;
                if enabled {
                    modules.retain(|m| m.is_enabled());
                }
                emit(&formatter.format_modules(&modules));
                Ok(ExitCode::Success)
            }
            ModuleAction::Enable { names } => {
                let changed = if let [name] = names.as_slice() {
                    vec![app.registry.enable(name).await?.name]
                } else {
                    app.registry.enable_many(&names).await?
                };
                formatter.success(&format!("Enabled {}", changed.join(", ")));
                emit(&formatter.format_success(
                    &ChangedOutput { action: "enabled", modules: &changed },
                    "module enable",
                ));
                Ok(ExitCode::Success)
            }
            ModuleAction::Disable { names } => {
                let changed = if let [name] = names.as_slice() {
                    vec![app.registry.disable(name).await?.name]
                } else {
                    app.registry.disable_many(&names).await?
                };
                formatter.success(&format!("Disabled {}", changed.join(", ")));
                emit(&formatter.format_success(
                    &ChangedOutput { action: "disabled", modules: &changed },
                    "module disable",
                ));
                Ok(ExitCode::Success)
            }
            ModuleAction::Uninstall { name, remove_files } => {
                let module = app.registry.uninstall(&name, remove_files).await?;
                let message = if remove_files {
                    format!("Uninstalled {} and removed {}", module.name, module.path.display())
                } else {
                    format!("Uninstalled {}", module.name)
                };
                formatter.success(&message);
                emit(&formatter.format_success(&SuccessMessage::new(message), "module uninstall"));
                Ok(ExitCode::Success)
            }
            ModuleAction::Migrate { name, seed } => {
                formatter.progress(&format!("Running migrations of {name}..."));
                let (migrations, seeders) = app.orchestrator.migrate(&name, seed).await?;
                formatter.success(&format!(
                    "Ran {} migration(s) and {} seeder(s) for {name}",
                    migrations.len(),
                    seeders.len()
                ));
                emit(&formatter.format_success(
                    &MigrationOutput {
                        module: &name,
                        migrations: &migrations,
                        seeders: &seeders,
                    },
                    "module migrate",
                ));
                Ok(ExitCode::Success)
            }
            ModuleAction::Update { name, preview: true } => {
                let preview = match app.orchestrator.preview(&name).await {
                    Err(UpdateError::NoUpdateAvailable { .. }) => {
                        formatter.success(&format!("{name} is up to date"));
                        return Ok(ExitCode::Success);
                    }
                    other => other?,
                };
                emit(&formatter.format_preview(&preview));
                if !preview.core_compatible {
                    formatter.warning(&format!(
                        "{} {} is not compatible with core {}",
                        name,
                        preview.to_version,
                        app.registry.environment().core_version
                    ));
                }
                Ok(ExitCode::Success)
            }
            ModuleAction::Update { name, preview: false } => update(&app, &name, formatter).await,
            ModuleAction::Rollback { name, to, backup } => {
                let path = match (backup, to) {
                    (Some(path), _) => path,
                    (None, Some(version)) => {
                        let version = ModuleVersion::parse(&version).map_err(CoreError::from)?;
                        app.orchestrator
                            .backups()
                            .find_backup(&name, &version)?
                            .ok_or_else(|| UpdateError::BackupNotFound {
                                path: app.orchestrator.backups().backup_dir().join(&name),
                            })?
                            .path
                    }
                    (None, None) => {
                        app.orchestrator
                            .backups()
                            .latest_backup(&name)?
                            .ok_or_else(|| UpdateError::BackupNotFound {
                                path: app.orchestrator.backups().backup_dir().join(&name),
                            })?
                            .path
                    }
                };
                formatter.progress(&format!("Restoring {name} from {}...", path.display()));
                let module = app.orchestrator.rollback(&name, &path).await?;
                let message = format!("Restored {} {}", module.name, module.version);
                formatter.success(&message);
                emit(&formatter.format_success(&SuccessMessage::new(message), "module rollback"));
                Ok(ExitCode::Success)
            }
            ModuleAction::Backups { name } => {
                let backups = app.orchestrator.list_backups(&name)?;
                emit(&formatter.format_backups(&backups));
                Ok(ExitCode::Success)
            }
            ModuleAction::History { name } => {
                let records = app.orchestrator.history(&name).await?;
                emit(&formatter.format_history(&records));
                Ok(ExitCode::Success)
            }
            ModuleAction::CheckUpdates => {
                formatter.progress("Checking for updates...");
                let updates = app.orchestrator.check_updates().await?;
                emit(&formatter.format_available(&updates));
                Ok(ExitCode::Success)
            }
        }
    }
}

/// Run an update; Ctrl-C requests cancellation, which is only honoured
/// before the backup starts.
async fn update(app: &App, name: &str, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
    formatter.progress(&format!("Updating {name}..."));
    let update = app.orchestrator.update(name);
    tokio::pin!(update);

    let result = loop {
        tokio::select! {
            result = &mut update => break result,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    formatter.warning(&format!("Could not listen for Ctrl-C: {e}"));
                    break (&mut update).await;
                }
                match app.orchestrator.cancel_update(name) {
                    Ok(status) => formatter.warning(&format!("Cancelling update of {name} while {status}")),
                    Err(e) => formatter.warning(&format!("{e}; waiting for the update to finish")),
                }
            }
        }
    };

    match result {
        Ok(outcome) => {
            emit(&formatter.format_update(&outcome));
            for warning in &outcome.warnings {
                formatter.warning(warning);
            }
            let version = outcome
                .record
                .to_version
                .as_ref()
                .map_or_else(|| "?".to_string(), |v| v.to_string());
            formatter.success(&format!("Updated {name} to {version}"));
            Ok(ExitCode::Success)
        }
        Err(UpdateError::NoUpdateAvailable { .. }) => {
            formatter.success(&format!("{name} is up to date"));
            Ok(ExitCode::Success)
        }
        Err(e) => Err(e.into()),
    }
}

/// Print formatted output unless there is none.
fn emit(output: &str) {
    if !output.is_empty() {
        println!("{output}");
    }
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the default config file location
    Path,
    /// Print the effective configuration as TOML
    Show,
    /// Print a commented sample configuration
    Sample,
}

impl ConfigArgs {
    pub fn execute(self, config: &Config, formatter: &OutputFormatter) -> anyhow::Result<ExitCode> {
        match self.action {
            ConfigAction::Path => {
                let path = Config::default_path()
                    .ok_or_else(|| anyhow::anyhow!("Could not determine the config directory"))?;
                match formatter.format() {
                    OutputFormat::Table => println!("{}", path.display()),
                    _ => emit(&formatter.format_success(
                        &SuccessMessage::new(path.display().to_string()),
                        "config path",
                    )),
                }
            }
            ConfigAction::Show => match formatter.format() {
                OutputFormat::Table => println!("{}", toml::to_string_pretty(config)?),
                _ => emit(&formatter.format_success(config, "config show")),
            },
            ConfigAction::Sample => println!("{}", Config::sample_toml()),
        }
        Ok(ExitCode::Success)
    }
}
