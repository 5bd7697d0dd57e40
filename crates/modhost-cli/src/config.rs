//! Configuration management for the modhost CLI
//!
//! This module handles loading, saving, and validating configuration for the
//! `modhost` binary. Configuration is stored in TOML format.
//!
//! # Configuration File Locations
//!
//! - Linux: `~/.config/modhost/modhost.toml`
//! - macOS: `~/Library/Application Support/dev.modhost.modhost/modhost.toml`
//! - Windows: `%APPDATA%\modhost\modhost\config\modhost.toml`

use std::path::{Path, PathBuf};

use modhost_core::ModuleVersion;
use modhost_updater::UpdateConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// CLI configuration
///
/// # Example TOML
///
/// ```toml
/// [paths]
/// modules_dir = "/srv/app/modules"
/// state_dir = ""  # Empty = platform data dir
///
/// [environment]
/// core_version = "1.5.0"
/// extensions = ["pdo", "mbstring"]
///
/// [update]
/// require_checksum = true
///
/// [update.rollback]
/// max_backups = 3
///
/// [migrations]
/// migrate_command = "php artisan migrate --path={file}"
/// timeout_seconds = 300
///
/// [output]
/// format = "table"  # "table" | "json" | "quiet"
///
/// [logging]
/// level = "warn"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// The running host
    #[serde(default)]
    pub environment: EnvironmentConfig,

    /// Update pipeline settings
    #[serde(default)]
    pub update: UpdateConfig,

    /// Migration and seeder commands
    #[serde(default)]
    pub migrations: MigrationsConfig,

    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding one sub-directory per installed module
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,

    /// Registry, history and migration ledger (empty = platform data dir)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from("modules")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            modules_dir: default_modules_dir(),
            state_dir: None,
        }
    }
}

impl PathsConfig {
    /// State directory, falling back to the platform data dir and then to
    /// `.modhost` beside the modules.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .or_else(Config::data_dir)
            .unwrap_or_else(|| PathBuf::from(".modhost"))
    }
}

/// The host the modules run in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Version of the host core, checked against module requirements
    #[serde(default = "default_core_version")]
    pub core_version: String,

    /// Runtime extensions that are loaded
    #[serde(default)]
    pub extensions: Vec<String>,
}

fn default_core_version() -> String {
    "1.0.0".to_string()
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            core_version: default_core_version(),
            extensions: Vec::new(),
        }
    }
}

/// Commands that run module migrations and seeders
///
/// `{module}`, `{file}` and `{name}` are replaced per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    #[serde(default)]
    pub migrate_command: Option<String>,

    #[serde(default)]
    pub seed_command: Option<String>,

    /// Time allowed for one step
    #[serde(default = "default_step_timeout")]
    pub timeout_seconds: u64,
}

fn default_step_timeout() -> u64 {
    300
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            migrate_command: None,
            seed_command: None,
            timeout_seconds: default_step_timeout(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format: "table", "json", "quiet"
    #[serde(default = "default_format")]
    pub format: String,

    /// Verbose output
    #[serde(default)]
    pub verbose: bool,

    /// Enable colors
    #[serde(default = "default_colors")]
    pub colors: bool,
}

fn default_format() -> String {
    "table".to_string()
}

fn default_colors() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            verbose: false,
            colors: default_colors(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from custom path or default
    pub fn load_from(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = custom_path {
            Self::load(path)
        } else {
            Self::load_default()
        }
    }

    /// Get default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("modhost.toml"))
    }

    /// Get the config directory path
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "modhost", "modhost")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the data directory path (registry state, history, backups)
    pub fn data_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "modhost", "modhost")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create default configuration file if it doesn't exist
    pub fn create_default_if_missing() -> Result<bool, ConfigError> {
        if let Some(path) = Self::default_path() {
            if !path.exists() {
                let config = Self::default();
                config.save(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Parsed core version of the host.
    pub fn core_version(&self) -> Result<ModuleVersion, ConfigError> {
        ModuleVersion::parse(&self.environment.core_version).map_err(|e| {
            ConfigError::ValidationError(format!(
                "Invalid core_version '{}': {e}",
                self.environment.core_version
            ))
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_formats = ["table", "json", "quiet"];
        if !valid_formats.contains(&self.output.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid output format '{}'. Valid values: {:?}",
                self.output.format, valid_formats
            )));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Valid values: {:?}",
                self.logging.level, valid_levels
            )));
        }

        self.core_version()?;

        if self.migrations.timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "migrations.timeout_seconds must be greater than 0".to_string(),
            ));
        }

        let api_url = &self.update.release.api_url;
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "Invalid release API URL '{}': must start with http:// or https://",
                api_url
            )));
        }

        self.update
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Generate a sample configuration file content
    pub fn sample_toml() -> &'static str {
        r#"# modhost configuration

[paths]
# Directory with one sub-directory per installed module
modules_dir = "modules"
# Registry, update history and migration ledger (empty = platform data dir)
# state_dir = ""

[environment]
# Version of the running host core
core_version = "1.0.0"
# Loaded runtime extensions
extensions = []

[update]
# Refuse releases that publish no checksum
require_checksum = true
# staging_dir = ""

[update.release]
api_url = "https://api.github.com"
allow_prerelease = false
cache_ttl_seconds = 3600

[update.network]
timeout_seconds = 30
download_timeout_seconds = 600

[update.rollback]
max_backups = 3
# backup_dir = ""

[update.health]
# route_url_template = "http://localhost:8080/{module}"

[migrations]
# migrate_command = "php artisan migrate --path={file}"
# seed_command = "php artisan db:seed --class={name}"
timeout_seconds = 300

[output]
# Output format: "table", "json", "quiet"
format = "table"
verbose = false
colors = true

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
level = "warn"
"#
    }
}

/// CLI configuration overrides
///
/// Command-line arguments take precedence over config file values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Output format override
    pub output_format: Option<String>,
    /// Verbose flag override
    pub verbose: Option<bool>,
    /// Debug flag override
    pub debug: Option<bool>,
    /// Modules directory override
    pub modules_dir: Option<PathBuf>,
    /// State directory override
    pub state_dir: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to configuration
    pub fn with_overrides(mut self, overrides: &CliOverrides) -> Self {
        if let Some(ref format) = overrides.output_format {
            self.output.format = format.clone();
        }
        if let Some(verbose) = overrides.verbose {
            self.output.verbose = verbose;
        }
        if let Some(true) = overrides.debug {
            self.logging.level = "debug".to_string();
        }
        if let Some(ref dir) = overrides.modules_dir {
            self.paths.modules_dir = dir.clone();
        }
        if let Some(ref dir) = overrides.state_dir {
            self.paths.state_dir = Some(dir.clone());
        }
        self
    }
}
