//! Append-only update history.
//!
//! One `UpdateRecord` exists per update attempt. A record moves through the
//! pipeline states and becomes immutable once it reaches a terminal one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use modhost_core::store::write_atomic;
use modhost_core::{ModuleVersion, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::UpdateError;
use crate::status::UpdateStatus;

/// History entry for one update attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub id: Uuid,
    pub module: String,
    pub from_version: ModuleVersion,
    /// Unknown until the release has been resolved
    pub to_version: Option<ModuleVersion>,
    status: UpdateStatus,
    #[serde(default)]
    pub migrations_run: Vec<String>,
    #[serde(default)]
    pub seeders_run: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub backup_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl UpdateRecord {
    pub fn new(module: impl Into<String>, from_version: ModuleVersion) -> Self {
        Self {
            id: Uuid::new_v4(),
            module: module.into(),
            from_version,
            to_version: None,
            status: UpdateStatus::Pending,
            migrations_run: Vec::new(),
            seeders_run: Vec::new(),
            error: None,
            backup_path: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn status(&self) -> UpdateStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, enforcing the transition table.
    pub fn advance(&mut self, next: UpdateStatus) -> Result<(), UpdateError> {
        if self.status.is_terminal() {
            return Err(UpdateError::RecordImmutable(self.id));
        }
        if !self.status.can_transition_to(next) {
            return Err(UpdateError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Move to a terminal status and record the error message, if any.
    pub fn finish(&mut self, status: UpdateStatus, error: Option<String>) -> Result<(), UpdateError> {
        if !status.is_terminal() {
            return Err(UpdateError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }
        self.advance(status)?;
        self.error = error;
        Ok(())
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Repository for update records, keyed by record id.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Add a new record. Fails if the id is already present.
    async fn append(&self, record: UpdateRecord) -> Result<(), UpdateError>;

    /// Replace a stored record. Terminal records cannot be replaced.
    async fn save(&self, record: UpdateRecord) -> Result<(), UpdateError>;

    async fn find(&self, id: Uuid) -> Result<Option<UpdateRecord>, UpdateError>;

    /// Records of one module, newest first.
    async fn list_for_module(&self, module: &str) -> Result<Vec<UpdateRecord>, UpdateError>;

    /// All records, newest first.
    async fn list_all(&self) -> Result<Vec<UpdateRecord>, UpdateError>;
}

fn apply_append(records: &mut Vec<UpdateRecord>, record: UpdateRecord) -> Result<(), UpdateError> {
    if records.iter().any(|r| r.id == record.id) {
        return Err(StoreError::OperationFailed(format!("duplicate update record {}", record.id)).into());
    }
    records.push(record);
    Ok(())
}

fn apply_save(records: &mut [UpdateRecord], record: UpdateRecord) -> Result<(), UpdateError> {
    let slot = records
        .iter_mut()
        .find(|r| r.id == record.id)
        .ok_or(UpdateError::HistoryRecordNotFound(record.id))?;
    if slot.is_terminal() {
        return Err(UpdateError::RecordImmutable(record.id));
    }
    *slot = record;
    Ok(())
}

fn newest_first(records: impl Iterator<Item = UpdateRecord>) -> Vec<UpdateRecord> {
    let mut list: Vec<UpdateRecord> = records.collect();
    list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    list
}

// ============================================================================
// In-Memory Store Implementation
// ============================================================================

#[derive(Default, Clone)]
pub struct InMemoryHistoryStore {
    records: Arc<RwLock<Vec<UpdateRecord>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, record: UpdateRecord) -> Result<(), UpdateError> {
        apply_append(&mut *self.records.write().await, record)
    }

    async fn save(&self, record: UpdateRecord) -> Result<(), UpdateError> {
        apply_save(&mut self.records.write().await, record)
    }

    async fn find(&self, id: Uuid) -> Result<Option<UpdateRecord>, UpdateError> {
        Ok(self.records.read().await.iter().find(|r| r.id == id).cloned())
    }

    async fn list_for_module(&self, module: &str) -> Result<Vec<UpdateRecord>, UpdateError> {
        let records = self.records.read().await;
        Ok(newest_first(
            records.iter().filter(|r| r.module == module).cloned(),
        ))
    }

    async fn list_all(&self) -> Result<Vec<UpdateRecord>, UpdateError> {
        Ok(newest_first(self.records.read().await.iter().cloned()))
    }
}

// ============================================================================
// JSON File Store Implementation
// ============================================================================

/// History kept in a single JSON array, rewritten atomically on change.
pub struct JsonFileHistoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<UpdateRecord>, UpdateError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::DataCorruption(format!("{}: {}", self.path.display(), e)).into()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, records: &[UpdateRecord]) -> Result<(), UpdateError> {
        let json = serde_json::to_vec_pretty(records)?;
        Ok(write_atomic(&self.path, &json).await?)
    }
}

#[async_trait]
impl HistoryStore for JsonFileHistoryStore {
    async fn append(&self, record: UpdateRecord) -> Result<(), UpdateError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        apply_append(&mut records, record)?;
        self.write_all(&records).await
    }

    async fn save(&self, record: UpdateRecord) -> Result<(), UpdateError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        apply_save(&mut records, record)?;
        self.write_all(&records).await
    }

    async fn find(&self, id: Uuid) -> Result<Option<UpdateRecord>, UpdateError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.into_iter().find(|r| r.id == id))
    }

    async fn list_for_module(&self, module: &str) -> Result<Vec<UpdateRecord>, UpdateError> {
        let _guard = self.lock.lock().await;
        let records = self.read_all().await?;
        Ok(newest_first(records.into_iter().filter(|r| r.module == module)))
    }

    async fn list_all(&self) -> Result<Vec<UpdateRecord>, UpdateError> {
        let _guard = self.lock.lock().await;
        Ok(newest_first(self.read_all().await?.into_iter()))
    }
}
