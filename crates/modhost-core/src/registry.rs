//! The module registry: the single owner of module state changes.
//!
//! All status changes go through here. Resolution runs against a fresh
//! graph snapshot while a registry-wide lock is held, so two callers cannot
//! validate against a graph the other is about to change.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::events::{EventBus, ModuleEvent};
use crate::graph::ModuleGraph;
use crate::manifest::{scan_modules_dir, ModuleManifest};
use crate::module::{Environment, Module};
use crate::resolver::DependencyResolver;
use crate::store::ModuleStore;
use crate::version::ModuleVersion;

/// Result of scanning the modules directory.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DiscoveryReport {
    /// Newly registered modules
    pub discovered: Vec<String>,
    /// Known modules whose manifest was re-read
    pub refreshed: Vec<String>,
    /// Registered modules whose directory is gone
    pub missing: Vec<String>,
    /// One message per manifest that could not be used
    pub invalid: Vec<String>,
}

pub struct ModuleRegistry {
    store: Arc<dyn ModuleStore>,
    environment: Environment,
    events: Arc<EventBus>,
    graph_lock: Mutex<()>,
}

impl ModuleRegistry {
    pub fn new(store: Arc<dyn ModuleStore>, environment: Environment, events: Arc<EventBus>) -> Self {
        Self {
            store,
            environment,
            events,
            graph_lock: Mutex::new(()),
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Build a graph snapshot from the current store contents.
    pub async fn graph(&self) -> Result<ModuleGraph, CoreError> {
        let modules = self.store.list_modules().await?;
        Ok(ModuleGraph::build(&modules))
    }

    pub async fn find(&self, name: &str) -> Result<Module, CoreError> {
        self.store
            .find_module(name)
            .await?
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Module>, CoreError> {
        Ok(self.store.list_modules().await?)
    }

    pub async fn can_enable(&self, name: &str) -> Result<(), CoreError> {
        let graph = self.graph().await?;
        DependencyResolver::new(&graph, &self.environment).can_enable(name)
    }

    pub async fn can_disable(&self, name: &str) -> Result<(), CoreError> {
        let graph = self.graph().await?;
        DependencyResolver::new(&graph, &self.environment).can_disable(name)
    }

    /// Enable one module after re-checking its requirements.
    pub async fn enable(&self, name: &str) -> Result<Module, CoreError> {
        let _guard = self.graph_lock.lock().await;
        let graph = self.graph().await?;
        let module = graph
            .get(name)
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))?;
        if module.is_enabled() {
            return Err(CoreError::AlreadyEnabled(name.to_string()));
        }
        DependencyResolver::new(&graph, &self.environment).can_enable(name)?;

        let mut module = module.clone();
        module.mark_enabled(Utc::now());
        self.store.save_module(module.clone()).await?;
        info!(module = %name, "Module enabled");

        self.events.publish(ModuleEvent::Enabled {
            module: name.to_string(),
        });
        Ok(module)
    }

    /// Disable one module if nothing enabled depends on it.
    pub async fn disable(&self, name: &str) -> Result<Module, CoreError> {
        let _guard = self.graph_lock.lock().await;
        let graph = self.graph().await?;
        let module = graph
            .get(name)
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))?;
        if !module.is_enabled() {
            return Err(CoreError::AlreadyDisabled(name.to_string()));
        }
        DependencyResolver::new(&graph, &self.environment).can_disable(name)?;

        let mut module = module.clone();
        module.mark_disabled(Utc::now());
        self.store.save_module(module.clone()).await?;
        info!(module = %name, "Module disabled");

        self.events.publish(ModuleEvent::Disabled {
            module: name.to_string(),
        });
        Ok(module)
    }

    /// Enable a set of modules in dependency order, all or nothing.
    ///
    /// Returns the names that changed, in the order they were enabled.
    pub async fn enable_many(&self, names: &[String]) -> Result<Vec<String>, CoreError> {
        let _guard = self.graph_lock.lock().await;
        let graph = self.graph().await?;
        let plan = DependencyResolver::new(&graph, &self.environment).plan_enable(names)?;
        self.apply_plan(&graph, &plan, true).await?;

        for name in &plan {
            self.events.publish(ModuleEvent::Enabled { module: name.clone() });
        }
        Ok(plan)
    }

    /// Disable a set of modules, dependents first, all or nothing.
    pub async fn disable_many(&self, names: &[String]) -> Result<Vec<String>, CoreError> {
        let _guard = self.graph_lock.lock().await;
        let graph = self.graph().await?;
        let plan = DependencyResolver::new(&graph, &self.environment).plan_disable(names)?;
        self.apply_plan(&graph, &plan, false).await?;

        for name in &plan {
            self.events.publish(ModuleEvent::Disabled { module: name.clone() });
        }
        Ok(plan)
    }

    async fn apply_plan(&self, graph: &ModuleGraph, plan: &[String], enable: bool) -> Result<(), CoreError> {
        let now = Utc::now();
        let mut saved: Vec<Module> = Vec::with_capacity(plan.len());

        for name in plan {
            let Some(original) = graph.get(name) else {
                continue;
            };
            let mut updated = original.clone();
            if enable {
                updated.mark_enabled(now);
            } else {
                updated.mark_disabled(now);
            }

            if let Err(e) = self.store.save_module(updated).await {
                warn!("Store failed while applying batch at {}: {}; reverting", name, e);
                for original in saved.into_iter().rev() {
                    if let Err(revert) = self.store.save_module(original.clone()).await {
                        warn!("Failed to revert {}: {}", original.name, revert);
                    }
                }
                return Err(e.into());
            }
            saved.push(original.clone());
        }

        info!(
            "{} {} module(s): {}",
            if enable { "Enabled" } else { "Disabled" },
            plan.len(),
            plan.join(", ")
        );
        Ok(())
    }

    /// Scan `modules_dir` and reconcile the store with what is installed.
    pub async fn discover(&self, modules_dir: &Path) -> Result<DiscoveryReport, CoreError> {
        let _guard = self.graph_lock.lock().await;
        let dir = modules_dir.to_path_buf();
        let scan = tokio::task::spawn_blocking(move || scan_modules_dir(&dir))
            .await
            .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))??;

        let mut report = DiscoveryReport {
            invalid: scan.invalid.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        };
        let now = Utc::now();
        let mut seen: HashSet<String> = HashSet::new();
        let mut events = Vec::new();

        for (path, manifest) in scan.found {
            seen.insert(manifest.name.clone());
            match self.store.find_module(&manifest.name).await? {
                Some(mut existing) => {
                    existing.refresh_from_manifest(manifest);
                    existing.path = path;
                    debug!(module = %existing.name, "Refreshed manifest");
                    report.refreshed.push(existing.name.clone());
                    self.store.save_module(existing).await?;
                }
                None => {
                    let module = Module::from_manifest(manifest, path, now);
                    info!(module = %module.name, version = %module.version, "Discovered module");
                    report.discovered.push(module.name.clone());
                    events.push(ModuleEvent::Discovered {
                        module: module.name.clone(),
                        version: module.version.clone(),
                    });
                    self.store.save_module(module).await?;
                }
            }
        }

        for module in self.store.list_modules().await? {
            if !seen.contains(&module.name) {
                warn!(module = %module.name, "Module directory missing: {}", module.path.display());
                report.missing.push(module.name);
            }
        }

        for event in events {
            self.events.publish(event);
        }
        Ok(report)
    }

    /// Remove a disabled module that nothing depends on.
    ///
    /// With `remove_files` the module directory is deleted as well.
    pub async fn uninstall(&self, name: &str, remove_files: bool) -> Result<Module, CoreError> {
        let _guard = self.graph_lock.lock().await;
        let graph = self.graph().await?;
        let module = graph
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))?;
        if module.is_enabled() {
            return Err(CoreError::ModuleEnabled(name.to_string()));
        }
        DependencyResolver::new(&graph, &self.environment).can_uninstall(name)?;

        self.store.delete_module(name).await?;
        if remove_files && module.path.exists() {
            tokio::fs::remove_dir_all(&module.path).await?;
        }
        info!(module = %name, "Module uninstalled");

        self.events.publish(ModuleEvent::Uninstalled {
            module: name.to_string(),
        });
        Ok(module)
    }

    /// Re-read a module's manifest from its directory, keeping its status.
    pub async fn sync_from_disk(&self, name: &str) -> Result<Module, CoreError> {
        let _guard = self.graph_lock.lock().await;
        let mut module = self.find(name).await?;
        let manifest = load_manifest(module.manifest_path()).await?;
        module.refresh_from_manifest(manifest);
        module.updated_at = Utc::now();
        self.store.save_module(module.clone()).await?;
        Ok(module)
    }

    /// Record that a module now runs `version`, refreshing its manifest
    /// fields when the installed manifest is readable.
    pub async fn record_version(&self, name: &str, version: &ModuleVersion) -> Result<Module, CoreError> {
        let _guard = self.graph_lock.lock().await;
        let mut module = self.find(name).await?;
        match load_manifest(module.manifest_path()).await {
            Ok(manifest) => module.refresh_from_manifest(manifest),
            Err(e) => warn!(module = %name, "Could not re-read manifest: {}", e),
        }
        if module.version != *version {
            debug!(module = %name, "Manifest reports {}, recording {}", module.version, version);
            module.version = version.clone();
        }
        module.updated_at = Utc::now();
        self.store.save_module(module.clone()).await?;
        Ok(module)
    }
}

async fn load_manifest(path: PathBuf) -> Result<ModuleManifest, CoreError> {
    tokio::task::spawn_blocking(move || ModuleManifest::load(&path))
        .await
        .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?
}
