//! Configuration structures for the update system.
//!
//! Defines configuration for release lookup, networking, backup retention
//! and post-update health checks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Main update configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Directory for downloads and extraction (empty = system temp dir)
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Refuse releases that publish no checksum
    #[serde(default = "default_true")]
    pub require_checksum: bool,

    /// Release source configuration
    #[serde(default)]
    pub release: ReleaseConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Rollback configuration
    #[serde(default)]
    pub rollback: RollbackConfig,

    /// Health check configuration
    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            staging_dir: None,
            require_checksum: true,
            release: ReleaseConfig::default(),
            network: NetworkConfig::default(),
            rollback: RollbackConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl UpdateConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.rollback.max_backups == 0 {
            return Err(UpdateError::Config(
                "rollback.max_backups must be at least 1".to_string(),
            ));
        }
        if self.network.timeout_seconds == 0 || self.network.download_timeout_seconds == 0 {
            return Err(UpdateError::Config(
                "network timeouts must be at least 1 second".to_string(),
            ));
        }
        if self.release.archive_extensions.is_empty() {
            return Err(UpdateError::Config(
                "release.archive_extensions must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Staging directory, using the system temp dir if not specified.
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("modhost-staging"))
    }
}

/// Where and how releases are looked up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Base URL of the releases API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Access token for private repositories and higher rate limits
    #[serde(default)]
    pub token: Option<String>,

    /// Whether prerelease versions are offered as updates
    #[serde(default)]
    pub allow_prerelease: bool,

    /// How long a release lookup stays cached
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,

    /// Asset name suffixes treated as installable archives
    #[serde(default = "default_archive_extensions")]
    pub archive_extensions: Vec<String>,

    /// Asset name suffix of the published checksum
    #[serde(default = "default_checksum_extension")]
    pub checksum_extension: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: None,
            allow_prerelease: false,
            cache_ttl_seconds: default_cache_ttl(),
            archive_extensions: default_archive_extensions(),
            checksum_extension: default_checksum_extension(),
        }
    }
}

impl ReleaseConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

/// Rollback configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Maximum number of backups to retain per module
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// Directory for storing backups (empty = default location)
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_backups: default_max_backups(),
            backup_dir: None,
        }
    }
}

impl RollbackConfig {
    /// Get the backup directory, using default if not specified.
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".").join("backups"))
    }
}

/// Network configuration for release lookups and downloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Per-request timeout in seconds; a timed-out phase fails
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Time allowed for streaming one release artifact
    #[serde(default = "default_download_timeout")]
    pub download_timeout_seconds: u64,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            download_timeout_seconds: default_download_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl NetworkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_seconds)
    }
}

/// Post-update health check configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// URL probed after an update; `{module}` is replaced by the module name
    #[serde(default)]
    pub route_url_template: Option<String>,
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_archive_extensions() -> Vec<String> {
    vec![".zip".to_string()]
}

fn default_checksum_extension() -> String {
    ".sha256".to_string()
}

fn default_max_backups() -> usize {
    3
}

fn default_timeout() -> u64 {
    30
}

fn default_download_timeout() -> u64 {
    600
}

fn default_user_agent() -> String {
    format!("modhost-updater/{}", env!("CARGO_PKG_VERSION"))
}
