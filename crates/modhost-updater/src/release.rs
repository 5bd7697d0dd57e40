//! Release lookup.
//!
//! `ReleaseSource` is the contract the orchestrator consumes: find the
//! newest acceptable release of a repository, download its artifact, and
//! fetch the checksum published next to it. `GitHubReleaseSource` talks to
//! a GitHub-compatible releases API and caches lookups per repository.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use modhost_core::{ModuleVersion, RepositoryRef, VersionConstraint};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checksum;
use crate::config::{ReleaseConfig, UpdateConfig};
use crate::download::{Downloader, DownloaderConfig, ProgressCallback};
use crate::error::UpdateError;

/// Marker line in release notes declaring the core versions a release needs.
const CORE_REQUIREMENT_PREFIX: &str = "requires core:";

/// One published release of a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub repository: RepositoryRef,
    pub tag: String,
    pub version: ModuleVersion,
    /// Artifact URL; `None` when the release carries no installable archive
    pub download_url: Option<String>,
    pub asset_name: Option<String>,
    pub checksum_url: Option<String>,
    #[serde(default)]
    pub release_notes: String,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub prerelease: bool,
    /// Core versions this release runs on; `None` means any
    pub requires_core: Option<VersionConstraint>,
    pub size: Option<u64>,
}

impl ReleaseInfo {
    pub fn is_major_upgrade_from(&self, installed: &ModuleVersion) -> bool {
        self.version.is_major_upgrade_from(installed)
    }

    pub fn is_compatible_with(&self, core: &ModuleVersion) -> bool {
        self.requires_core
            .as_ref()
            .map_or(true, |constraint| constraint.satisfied_by(core))
    }

    /// File name the artifact is staged under.
    pub fn artifact_file_name(&self) -> String {
        self.asset_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}.zip", self.repository.repo, self.tag))
    }
}

// ============================================================================
// Source Trait
// ============================================================================

#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Newest release accepted by the source's rules, or `None` if the
    /// repository has none.
    async fn latest_release(&self, repository: &RepositoryRef)
        -> Result<Option<ReleaseInfo>, UpdateError>;

    /// Download the release artifact into `destination_dir`.
    ///
    /// # Returns
    ///
    /// Path of the downloaded file.
    async fn download_release(
        &self,
        release: &ReleaseInfo,
        destination_dir: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, UpdateError>;

    /// The published checksum of the release artifact, if one exists.
    async fn fetch_checksum(&self, release: &ReleaseInfo) -> Result<Option<String>, UpdateError>;

    /// Compare `downloaded` with the published checksum.
    ///
    /// A release without a published checksum does not verify.
    async fn fetch_and_verify_checksum(
        &self,
        release: &ReleaseInfo,
        downloaded: &Path,
    ) -> Result<bool, UpdateError> {
        let Some(expected) = self.fetch_checksum(release).await? else {
            warn!(repository = %release.repository, tag = %release.tag, "Release publishes no checksum");
            return Ok(false);
        };
        let path = downloaded.to_path_buf();
        tokio::task::spawn_blocking(move || checksum::verify_file(&path, &expected))
            .await
            .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?
    }

    /// Latest release of every repository.
    ///
    /// A failed lookup resolves to `None` for that repository only.
    async fn batch_latest_releases(
        &self,
        repositories: &[RepositoryRef],
    ) -> HashMap<RepositoryRef, Option<ReleaseInfo>> {
        let lookups = repositories.iter().map(|repository| async move {
            let release = match self.latest_release(repository).await {
                Ok(release) => release,
                Err(e) => {
                    warn!(%repository, error = %e, "Release lookup failed");
                    None
                }
            };
            (repository.clone(), release)
        });
        join_all(lookups).await.into_iter().collect()
    }

    /// Drop cached lookups: one repository, every repository of an owner,
    /// or everything.
    fn clear_cache(&self, _owner: Option<&str>, _repo: Option<&str>) {}
}

// ============================================================================
// GitHub Releases
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: Option<u64>,
}

struct CachedLookup {
    fetched_at: Instant,
    release: Option<ReleaseInfo>,
}

/// Release source backed by the GitHub releases API.
pub struct GitHubReleaseSource {
    downloader: Downloader,
    config: ReleaseConfig,
    cache: Mutex<HashMap<RepositoryRef, CachedLookup>>,
}

impl GitHubReleaseSource {
    pub fn new(config: &UpdateConfig) -> Result<Self, UpdateError> {
        let downloader = Downloader::with_config(DownloaderConfig::from_network(
            &config.network,
            config.release.token.clone(),
        ))?;
        Ok(Self::with_downloader(downloader, config.release.clone()))
    }

    pub fn with_downloader(downloader: Downloader, config: ReleaseConfig) -> Self {
        Self {
            downloader,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<RepositoryRef, CachedLookup>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached(&self, repository: &RepositoryRef) -> Option<Option<ReleaseInfo>> {
        let ttl = self.config.cache_ttl();
        let cache = self.cache();
        let entry = cache.get(repository)?;
        if entry.fetched_at.elapsed() < ttl {
            Some(entry.release.clone())
        } else {
            None
        }
    }

    fn releases_url(&self, repository: &RepositoryRef) -> String {
        format!(
            "{}/repos/{}/{}/releases",
            self.config.api_url.trim_end_matches('/'),
            repository.owner,
            repository.repo
        )
    }

    async fn fetch_latest(&self, repository: &RepositoryRef) -> Result<Option<ReleaseInfo>, UpdateError> {
        let url = self.releases_url(repository);
        let Some(releases) = self.downloader.fetch_json::<Vec<GitHubRelease>>(&url).await? else {
            debug!(%repository, "Repository not found");
            return Ok(None);
        };

        let latest = releases
            .iter()
            .filter(|r| !r.draft)
            .filter_map(|r| to_release_info(repository, r, &self.config))
            .filter(|r| self.config.allow_prerelease || !(r.prerelease || r.version.is_prerelease()))
            .max_by(|a, b| a.version.cmp(&b.version));
        Ok(latest)
    }
}

#[async_trait]
impl ReleaseSource for GitHubReleaseSource {
    async fn latest_release(
        &self,
        repository: &RepositoryRef,
    ) -> Result<Option<ReleaseInfo>, UpdateError> {
        if let Some(hit) = self.cached(repository) {
            debug!(%repository, "Release cache hit");
            return Ok(hit);
        }

        let release = self.fetch_latest(repository).await?;
        if let Some(release) = &release {
            info!(%repository, tag = %release.tag, version = %release.version, "Latest release resolved");
        }
        self.cache().insert(
            repository.clone(),
            CachedLookup {
                fetched_at: Instant::now(),
                release: release.clone(),
            },
        );
        Ok(release)
    }

    async fn download_release(
        &self,
        release: &ReleaseInfo,
        destination_dir: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, UpdateError> {
        let url = release
            .download_url
            .as_deref()
            .ok_or_else(|| UpdateError::NoDownloadableAssets {
                module: release.repository.repo.clone(),
                tag: release.tag.clone(),
            })?;
        let dest = destination_dir.join(release.artifact_file_name());
        self.downloader
            .download_to_file(url, &dest, release.size, progress.as_ref())
            .await?;
        Ok(dest)
    }

    async fn fetch_checksum(&self, release: &ReleaseInfo) -> Result<Option<String>, UpdateError> {
        let Some(url) = release.checksum_url.as_deref() else {
            return Ok(None);
        };
        let content = self.downloader.fetch_text(url).await?;
        let asset = release.artifact_file_name();
        checksum::parse_checksum_file(&content, &asset)
            .map(Some)
            .ok_or_else(|| UpdateError::ChecksumMismatch {
                module: release.repository.repo.clone(),
                reason: format!("checksum file has no entry for {asset}"),
            })
    }

    fn clear_cache(&self, owner: Option<&str>, repo: Option<&str>) {
        let mut cache = self.cache();
        let before = cache.len();
        cache.retain(|key, _| {
            let owner_matches = owner.map_or(true, |o| key.owner == o);
            let repo_matches = repo.map_or(true, |r| key.repo == r);
            !(owner_matches && repo_matches)
        });
        debug!(removed = before - cache.len(), "Release cache cleared");
    }
}

/// Convert an API release. Returns `None` when the tag is not a version.
fn to_release_info(
    repository: &RepositoryRef,
    release: &GitHubRelease,
    config: &ReleaseConfig,
) -> Option<ReleaseInfo> {
    let version = match ModuleVersion::parse(&release.tag_name) {
        Ok(version) => version,
        Err(_) => {
            debug!(%repository, tag = %release.tag_name, "Skipping release with non-version tag");
            return None;
        }
    };

    let artifact = release.assets.iter().find(|asset| {
        !asset.name.ends_with(&config.checksum_extension)
            && config
                .archive_extensions
                .iter()
                .any(|ext| asset.name.ends_with(ext.as_str()))
    });
    let checksum = release
        .assets
        .iter()
        .find(|asset| asset.name.ends_with(&config.checksum_extension));
    let notes = release.body.clone().unwrap_or_default();

    Some(ReleaseInfo {
        repository: repository.clone(),
        tag: release.tag_name.clone(),
        version,
        download_url: artifact.map(|a| a.browser_download_url.clone()),
        asset_name: artifact.map(|a| a.name.clone()),
        checksum_url: checksum.map(|a| a.browser_download_url.clone()),
        requires_core: parse_core_requirement(&notes),
        release_notes: notes,
        published_at: release.published_at,
        prerelease: release.prerelease,
        size: artifact.and_then(|a| a.size),
    })
}

/// Find a `Requires core: <constraint>` line in release notes.
///
/// Leading list markers and emphasis are ignored. An unparsable constraint
/// is logged and treated as absent.
pub fn parse_core_requirement(notes: &str) -> Option<VersionConstraint> {
    notes.lines().find_map(|line| {
        let line = line.trim().trim_start_matches(['-', '*', '>', ' ']);
        let lower = line.to_ascii_lowercase();
        let rest = lower.strip_prefix(CORE_REQUIREMENT_PREFIX)?;
        let raw = rest.trim_matches(['`', '*', ' ']);
        match VersionConstraint::parse(raw) {
            Ok(constraint) => Some(constraint),
            Err(e) => {
                warn!(constraint = raw, error = %e, "Ignoring unparsable core requirement");
                None
            }
        }
    })
}
