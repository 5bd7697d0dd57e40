//! Shared fixtures for the updater integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;

use modhost_core::{
    Environment, EventBus, InMemoryModuleStore, Module, ModuleEvent, ModuleRegistry, ModuleVersion,
    RecordingListener, RepositoryRef, MANIFEST_FILE,
};
use modhost_updater::{
    BackupManager, DownloadProgress, HealthChecker, ModuleRuntime, ProbeOutcome, ProgressCallback,
    ReleaseInfo, ReleaseSource, UpdateConfig, UpdateError, UpdateOrchestrator,
};

pub const CORE_VERSION: &str = "1.5.0";

// =============================================================================
// Archives
// =============================================================================

/// Zip the given `(path, content)` entries in memory.
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn manifest_json(name: &str, version: &str) -> String {
    serde_json::json!({
        "name": name,
        "version": version,
        "repository": format!("acme/{name}"),
    })
    .to_string()
}

/// A release archive of `name` at `version`.
pub fn module_archive(name: &str, version: &str) -> Vec<u8> {
    let manifest = manifest_json(name, version);
    let view = format!("<h1>{name} {version}</h1>");
    zip_bytes(&[(MANIFEST_FILE, manifest.as_str()), ("views/index.html", view.as_str())])
}

// =============================================================================
// Fake release source
// =============================================================================

struct Published {
    release: ReleaseInfo,
    artifact: Vec<u8>,
    checksum: Option<String>,
}

/// Release source serving artifacts from memory.
///
/// With a gate installed, downloads signal `download_started` and then
/// wait until the gate is opened.
#[derive(Default)]
pub struct FakeSource {
    published: Mutex<HashMap<RepositoryRef, Published>>,
    gate: Mutex<Option<Arc<Notify>>>,
    pub download_started: Arc<Notify>,
    pub downloads: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish `version` of `name` with a matching checksum.
    pub fn publish(&self, name: &str, version: &str) -> ReleaseInfo {
        let artifact = module_archive(name, version);
        let checksum = Some(sha256_hex(&artifact));
        self.publish_with(name, version, artifact, checksum, None)
    }

    pub fn publish_with(
        &self,
        name: &str,
        version: &str,
        artifact: Vec<u8>,
        checksum: Option<String>,
        release_notes: Option<&str>,
    ) -> ReleaseInfo {
        let repository = RepositoryRef::new("acme", name);
        let notes = release_notes.unwrap_or_default().to_string();
        let release = ReleaseInfo {
            repository: repository.clone(),
            tag: format!("v{version}"),
            version: ModuleVersion::parse(version).unwrap(),
            download_url: Some(format!("memory://{name}/{version}")),
            asset_name: Some(format!("{name}.zip")),
            checksum_url: checksum.as_ref().map(|_| format!("memory://{name}/{version}.sha256")),
            requires_core: modhost_updater::parse_core_requirement(&notes),
            release_notes: notes,
            published_at: None,
            prerelease: false,
            size: Some(artifact.len() as u64),
        };
        self.published.lock().unwrap().insert(
            repository,
            Published {
                release: release.clone(),
                artifact,
                checksum,
            },
        );
        release
    }

    /// Make the next downloads wait; returns the handle that releases them.
    pub fn hold_downloads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn artifact_for(&self, release: &ReleaseInfo) -> Option<(Vec<u8>, Option<String>)> {
        self.published
            .lock()
            .unwrap()
            .get(&release.repository)
            .map(|p| (p.artifact.clone(), p.checksum.clone()))
    }
}

#[async_trait]
impl ReleaseSource for FakeSource {
    async fn latest_release(&self, repository: &RepositoryRef) -> Result<Option<ReleaseInfo>, UpdateError> {
        Ok(self
            .published
            .lock()
            .unwrap()
            .get(repository)
            .map(|p| p.release.clone()))
    }

    async fn download_release(
        &self,
        release: &ReleaseInfo,
        destination_dir: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, UpdateError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.download_started.notify_one();
            gate.notified().await;
        }

        let (artifact, _) = self.artifact_for(release).ok_or_else(|| UpdateError::DownloadFailed {
            module: release.repository.repo.clone(),
            reason: "not published".into(),
        })?;
        let dest = destination_dir.join(release.artifact_file_name());
        tokio::fs::write(&dest, &artifact).await?;
        if let Some(progress) = progress {
            let len = artifact.len() as u64;
            progress(DownloadProgress::new(len, len));
        }
        Ok(dest)
    }

    async fn fetch_checksum(&self, release: &ReleaseInfo) -> Result<Option<String>, UpdateError> {
        Ok(self.artifact_for(release).and_then(|(_, checksum)| checksum))
    }
}

// =============================================================================
// Health runtime
// =============================================================================

/// Health runtime with fixed probe outcomes.
pub struct ScriptedRuntime {
    pub provider: ProbeOutcome,
    pub routes: ProbeOutcome,
}

impl ScriptedRuntime {
    pub fn healthy() -> HealthChecker {
        Self::checker(ProbeOutcome::Passed, ProbeOutcome::Passed)
    }

    pub fn broken_provider() -> HealthChecker {
        Self::checker(
            ProbeOutcome::Failed("provider class not found".into()),
            ProbeOutcome::Passed,
        )
    }

    pub fn checker(provider: ProbeOutcome, routes: ProbeOutcome) -> HealthChecker {
        HealthChecker::new(Arc::new(Self { provider, routes }))
    }
}

#[async_trait]
impl ModuleRuntime for ScriptedRuntime {
    async fn load_provider(&self, _module: &Module) -> anyhow::Result<ProbeOutcome> {
        Ok(self.provider.clone())
    }

    async fn probe_routes(&self, _module: &Module) -> anyhow::Result<ProbeOutcome> {
        Ok(self.routes.clone())
    }

    async fn register_panel(&self, _module: &Module) -> anyhow::Result<ProbeOutcome> {
        Ok(ProbeOutcome::Passed)
    }
}

// =============================================================================
// Installed host
// =============================================================================

/// A temporary host with `blog` 1.0.0 installed and discovered.
pub struct Host {
    pub temp: TempDir,
    pub registry: Arc<ModuleRegistry>,
    pub events: Arc<RecordingListener>,
    pub config: UpdateConfig,
}

impl Host {
    pub async fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let host = Self::at(temp).await;
        host.install("blog", "1.0.0");
        host.registry.discover(&host.modules_dir()).await.unwrap();
        host
    }

    async fn at(temp: TempDir) -> Self {
        let events = Arc::new(RecordingListener::new());
        let bus = Arc::new(EventBus::new());
        bus.subscribe(events.clone());

        let environment = Environment::new(ModuleVersion::parse(CORE_VERSION).unwrap());
        let registry = Arc::new(ModuleRegistry::new(InMemoryModuleStore::new_shared(), environment, bus));

        let mut config = UpdateConfig::default();
        config.staging_dir = Some(temp.path().join("staging"));
        config.rollback.backup_dir = Some(temp.path().join("backups"));

        Self {
            temp,
            registry,
            events,
            config,
        }
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.temp.path().join("modules")
    }

    pub fn module_dir(&self, name: &str) -> PathBuf {
        self.modules_dir().join(name)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.temp.path().join("staging")
    }

    /// Write an installed copy of `name` at `version`.
    pub fn install(&self, name: &str, version: &str) {
        let dir = self.module_dir(name);
        fs::create_dir_all(dir.join("views")).unwrap();
        fs::write(dir.join(MANIFEST_FILE), manifest_json(name, version)).unwrap();
        fs::write(dir.join("views/index.html"), format!("<h1>{name} {version}</h1>")).unwrap();
        fs::write(dir.join("config.local.php"), "local settings").unwrap();
    }

    pub fn backups(&self) -> BackupManager {
        BackupManager::new(self.config.rollback.backup_dir(), self.config.rollback.max_backups)
    }

    pub fn orchestrator(&self, source: Arc<dyn ReleaseSource>) -> UpdateOrchestrator {
        UpdateOrchestrator::new(self.registry.clone(), source, self.backups(), self.config.clone())
            .unwrap()
            .with_health_checker(ScriptedRuntime::healthy())
    }

    /// Version in the installed manifest.
    pub fn installed_version(&self, name: &str) -> String {
        let raw = fs::read_to_string(self.module_dir(name).join(MANIFEST_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        value["version"].as_str().unwrap().to_string()
    }

    pub async fn registered_version(&self, name: &str) -> String {
        self.registry.find(name).await.unwrap().version.to_string()
    }

    pub fn events(&self) -> Vec<ModuleEvent> {
        self.events.events()
    }

    /// Staging directories left behind by update attempts.
    pub fn staging_leftovers(&self) -> usize {
        match fs::read_dir(self.staging_dir()) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

// =============================================================================
// HTTP server
// =============================================================================

/// Canned response for one path.
#[derive(Clone)]
pub struct Route {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

impl Route {
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            status: 200,
            body: value.to_string().into_bytes(),
            content_type: "application/json",
        }
    }

    pub fn bytes(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body,
            content_type: "application/octet-stream",
        }
    }

    pub fn text(body: &str) -> Self {
        Self {
            status: 200,
            body: body.as_bytes().to_vec(),
            content_type: "text/plain",
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            content_type: "text/plain",
        }
    }
}

/// Minimal HTTP/1.1 server answering GETs from a route table.
///
/// Unknown paths answer 404.
pub struct TestServer {
    pub base_url: String,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let routes: Arc<Mutex<HashMap<String, Route>>> = Arc::default();
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::default();

        let table = routes.clone();
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let table = table.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&request);
                    let path = head
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .split('?')
                        .next()
                        .unwrap_or("/")
                        .to_string();
                    *counter.lock().unwrap().entry(path.clone()).or_default() += 1;

                    let route = table
                        .lock()
                        .unwrap()
                        .get(&path)
                        .cloned()
                        .unwrap_or_else(|| Route::status(404));
                    let header = format!(
                        "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        route.status,
                        route.content_type,
                        route.body.len()
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    let _ = socket.write_all(&route.body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            base_url,
            routes,
            hits,
        }
    }

    /// Add or replace the response for `path`.
    pub fn insert(&self, path: &str, route: Route) {
        self.routes.lock().unwrap().insert(path.to_string(), route);
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}
