//! HTTP client for release metadata and artifact downloads.
//!
//! Handles streaming artifact downloads to disk with progress reporting.
//! Small documents (release listings, checksum files) are fetched into
//! memory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::UpdateError;

/// Default timeout for HTTP requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default read timeout for streaming downloads in seconds.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;

/// Configuration for the downloader.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Connection timeout in seconds.
    pub timeout_secs: u64,
    /// Read timeout for streaming in seconds.
    pub read_timeout_secs: u64,
    /// User agent string.
    pub user_agent: String,
    /// Bearer token sent with every request.
    pub token: Option<String>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            user_agent: format!("modhost-updater/{}", env!("CARGO_PKG_VERSION")),
            token: None,
        }
    }
}

impl DownloaderConfig {
    pub fn from_network(network: &NetworkConfig, token: Option<String>) -> Self {
        Self {
            timeout_secs: network.timeout_seconds,
            read_timeout_secs: network.timeout_seconds.max(DEFAULT_READ_TIMEOUT_SECS),
            user_agent: network.user_agent.clone(),
            token,
        }
    }
}

/// Progress callback type for download progress reporting.
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Streaming HTTP downloader.
pub struct Downloader {
    /// HTTP client configured with timeouts.
    client: reqwest::Client,
    config: DownloaderConfig,
}

impl Downloader {
    /// Create a new downloader with default settings.
    pub fn new() -> Result<Self, UpdateError> {
        Self::with_config(DownloaderConfig::default())
    }

    /// Create a new downloader with custom configuration.
    ///
    /// # Errors
    /// `Config` if the token is not a valid header value, `Http` if the
    /// client cannot be built.
    pub fn with_config(config: DownloaderConfig) -> Result<Self, UpdateError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| UpdateError::Config(format!("invalid release token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Fetch and decode a JSON document.
    ///
    /// Returns `Ok(None)` when the server answers 404.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, UpdateError> {
        debug!("Fetching JSON: {}", url);

        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(UpdateError::Http(format!(
                "GET {} returned {}",
                url,
                response.status().as_u16()
            )));
        }

        let bytes = response.bytes().await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Fetch a small text document into memory.
    pub async fn fetch_text(&self, url: &str) -> Result<String, UpdateError> {
        debug!("Fetching URL: {}", url);

        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(UpdateError::Http(format!(
                "GET {} returned {}",
                url,
                response.status().as_u16()
            )));
        }

        let text = response.text().await?;
        debug!("Fetched {} bytes", text.len());
        Ok(text)
    }

    /// Stream `url` into `dest`, reporting progress as chunks arrive.
    ///
    /// `expected_size` is used for progress when the server sends no
    /// content length, and is checked against the final size when given.
    ///
    /// # Returns
    ///
    /// The number of bytes written.
    pub async fn download_to_file(
        &self,
        url: &str,
        dest: &Path,
        expected_size: Option<u64>,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64, UpdateError> {
        info!("Starting download: {} -> {:?}", url, dest);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Http(format!(
                "GET {} returned {}",
                url,
                status.as_u16()
            )));
        }

        let total = response.content_length().or(expected_size).unwrap_or(0);
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        report(progress, downloaded, total);

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            report(progress, downloaded, total);
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = expected_size {
            if downloaded != expected {
                warn!(
                    "Download size mismatch: expected {}, got {}",
                    expected, downloaded
                );
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(UpdateError::Http(format!(
                    "download of {url} was {downloaded} bytes, expected {expected}"
                )));
            }
        }

        info!("Download complete: {} bytes", downloaded);
        Ok(downloaded)
    }
}

fn report(progress: Option<&ProgressCallback>, downloaded: u64, total: u64) {
    if let Some(callback) = progress {
        callback(DownloadProgress { downloaded, total });
    }
}

/// Download progress information.
///
/// `total` is zero when the size is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes to download.
    pub total: u64,
}

impl DownloadProgress {
    pub fn new(downloaded: u64, total: u64) -> Self {
        Self { downloaded, total }
    }

    /// Get download progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64) * 100.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.total && self.total > 0
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.downloaded)
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.total == 0 {
            write!(f, "{} bytes", self.downloaded)
        } else {
            write!(
                f,
                "{}/{} bytes ({:.1}%)",
                self.downloaded,
                self.total,
                self.percentage()
            )
        }
    }
}
