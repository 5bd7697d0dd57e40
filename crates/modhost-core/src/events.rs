//! Lifecycle notifications published after module state changes commit.

use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{info, warn};

use crate::version::ModuleVersion;

/// A committed change to a module.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ModuleEvent {
    Discovered {
        module: String,
        version: ModuleVersion,
    },
    Enabled {
        module: String,
    },
    Disabled {
        module: String,
    },
    Uninstalled {
        module: String,
    },
    UpdateCompleted {
        module: String,
        from: ModuleVersion,
        to: ModuleVersion,
    },
    UpdateFailed {
        module: String,
        error: String,
    },
    UpdateRolledBack {
        module: String,
        restored: ModuleVersion,
        error: String,
    },
    Restored {
        module: String,
        version: ModuleVersion,
    },
}

impl ModuleEvent {
    pub fn module(&self) -> &str {
        match self {
            Self::Discovered { module, .. }
            | Self::Enabled { module }
            | Self::Disabled { module }
            | Self::Uninstalled { module }
            | Self::UpdateCompleted { module, .. }
            | Self::UpdateFailed { module, .. }
            | Self::UpdateRolledBack { module, .. }
            | Self::Restored { module, .. } => module,
        }
    }
}

/// Receives module events. Registered explicitly on an [`EventBus`].
pub trait EventListener: Send + Sync {
    fn handle(&self, event: &ModuleEvent);
}

/// Synchronous publish/subscribe fan-out.
///
/// Listeners run in registration order on the publishing task.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn listener_count(&self) -> usize {
        match self.listeners.read() {
            Ok(listeners) => listeners.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn publish(&self, event: ModuleEvent) {
        let listeners: Vec<Arc<dyn EventListener>> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => {
                warn!("Event listener list was poisoned; continuing");
                poisoned.into_inner().clone()
            }
        };
        for listener in listeners {
            listener.handle(&event);
        }
    }
}

/// Writes every event to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn handle(&self, event: &ModuleEvent) {
        match event {
            ModuleEvent::UpdateFailed { module, error } => {
                warn!(module = %module, "Update failed: {}", error)
            }
            ModuleEvent::UpdateRolledBack { module, restored, error } => {
                warn!(module = %module, "Update rolled back to {}: {}", restored, error)
            }
            other => info!(module = other.module(), event = ?other, "Module event"),
        }
    }
}

/// Keeps every event it sees; handy for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: std::sync::Mutex<Vec<ModuleEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ModuleEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventListener for RecordingListener {
    fn handle(&self, event: &ModuleEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
