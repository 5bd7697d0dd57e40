//! Storage abstraction for installed module records.
//!
//! This module defines the `ModuleStore` trait and provides an in-memory
//! implementation for tests and a JSON-file implementation for the CLI.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::module::Module;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// Store Trait
// ============================================================================

/// Repository-style access to module records, keyed by module name.
#[async_trait]
pub trait ModuleStore: Send + Sync {
    /// Insert or replace a module record.
    async fn save_module(&self, module: Module) -> Result<(), StoreError>;

    /// Retrieve a module by name.
    ///
    /// # Returns
    /// * `Ok(Some(module))` if found
    /// * `Ok(None)` if not found
    /// * `Err(StoreError)` if the operation fails
    async fn find_module(&self, name: &str) -> Result<Option<Module>, StoreError>;

    /// List all modules ordered by name.
    async fn list_modules(&self) -> Result<Vec<Module>, StoreError>;

    /// Delete a module by name.
    ///
    /// # Returns
    /// * `Ok(true)` if a record was removed
    /// * `Ok(false)` if no record existed
    async fn delete_module(&self, name: &str) -> Result<bool, StoreError>;
}

// ============================================================================
// In-Memory Store Implementation
// ============================================================================

/// Thread-safe in-memory store.
#[derive(Default, Clone)]
pub struct InMemoryModuleStore {
    modules: Arc<RwLock<HashMap<String, Module>>>,
}

impl InMemoryModuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory store wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ModuleStore for InMemoryModuleStore {
    async fn save_module(&self, module: Module) -> Result<(), StoreError> {
        let mut modules = self.modules.write().await;
        modules.insert(module.name.clone(), module);
        Ok(())
    }

    async fn find_module(&self, name: &str) -> Result<Option<Module>, StoreError> {
        let modules = self.modules.read().await;
        Ok(modules.get(name).cloned())
    }

    async fn list_modules(&self) -> Result<Vec<Module>, StoreError> {
        let modules = self.modules.read().await;
        let mut list: Vec<Module> = modules.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn delete_module(&self, name: &str) -> Result<bool, StoreError> {
        let mut modules = self.modules.write().await;
        Ok(modules.remove(name).is_some())
    }
}

// ============================================================================
// JSON File Store Implementation
// ============================================================================

/// Store backed by a single JSON document.
///
/// The whole document is rewritten on every change through a temporary
/// file and a rename, so readers never observe a half-written file.
pub struct JsonFileModuleStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileModuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, Module>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::DataCorruption(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StoreError::OperationFailed(e.to_string())),
        }
    }

    async fn write_all(&self, modules: &BTreeMap<String, Module>) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(modules)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.path, &json).await
    }
}

#[async_trait]
impl ModuleStore for JsonFileModuleStore {
    async fn save_module(&self, module: Module) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut modules = self.read_all().await?;
        modules.insert(module.name.clone(), module);
        self.write_all(&modules).await
    }

    async fn find_module(&self, name: &str) -> Result<Option<Module>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(name))
    }

    async fn list_modules(&self) -> Result<Vec<Module>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.into_values().collect())
    }

    async fn delete_module(&self, name: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut modules = self.read_all().await?;
        let removed = modules.remove(name).is_some();
        if removed {
            self.write_all(&modules).await?;
        }
        Ok(removed)
    }
}

/// Write `bytes` to `path` through a sibling temporary file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::OperationFailed(e.to_string()))
}
