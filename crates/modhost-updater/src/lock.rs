//! Per-module update locks with cooperative cancellation.
//!
//! At most one update per module runs at a time; a second attempt fails
//! immediately instead of queueing. Different modules never contend. The
//! lock slot also carries the live pipeline status so cancel requests can
//! be accepted or refused atomically with respect to phase changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::error::UpdateError;
use crate::status::UpdateStatus;

#[derive(Debug)]
struct SlotState {
    status: UpdateStatus,
    cancel_requested: bool,
}

#[derive(Debug)]
struct LockSlot {
    state: Mutex<SlotState>,
}

impl LockSlot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registry of held update locks, shared by every orchestrator clone.
#[derive(Debug, Clone, Default)]
pub struct UpdateLocks {
    slots: Arc<Mutex<HashMap<String, Arc<LockSlot>>>>,
}

impl UpdateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<LockSlot>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the lock for `module` without waiting.
    ///
    /// # Errors
    /// `LockAcquisitionFailed` if an update of `module` already holds it.
    pub fn try_acquire(&self, module: &str) -> Result<UpdateGuard, UpdateError> {
        let mut slots = self.slots();
        if slots.contains_key(module) {
            debug!(module, "Update lock already held");
            return Err(UpdateError::LockAcquisitionFailed {
                module: module.to_string(),
            });
        }
        let slot = Arc::new(LockSlot {
            state: Mutex::new(SlotState {
                status: UpdateStatus::Pending,
                cancel_requested: false,
            }),
        });
        slots.insert(module.to_string(), slot.clone());
        debug!(module, "Update lock acquired");

        Ok(UpdateGuard {
            module: module.to_string(),
            slot,
            locks: self.clone(),
        })
    }

    pub fn is_locked(&self, module: &str) -> bool {
        self.slots().contains_key(module)
    }

    /// Live pipeline status of the update holding the lock, if any.
    pub fn status_of(&self, module: &str) -> Option<UpdateStatus> {
        let slot = self.slots().get(module).cloned()?;
        let status = slot.state().status;
        Some(status)
    }

    /// Modules with an update in progress and their current status.
    pub fn in_progress(&self) -> Vec<(String, UpdateStatus)> {
        let slots: Vec<(String, Arc<LockSlot>)> = self
            .slots()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();
        let mut list: Vec<(String, UpdateStatus)> = slots
            .into_iter()
            .map(|(name, slot)| {
                let status = slot.state().status;
                (name, status)
            })
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// Ask the update of `module` to stop at its next checkpoint.
    ///
    /// Returns the status at which the request was accepted.
    ///
    /// # Errors
    /// * `NoUpdateInProgress` if nothing holds the lock
    /// * `CancellationRefused` once the update has started backing up
    pub fn request_cancel(&self, module: &str) -> Result<UpdateStatus, UpdateError> {
        let slot = self
            .slots()
            .get(module)
            .cloned()
            .ok_or_else(|| UpdateError::NoUpdateInProgress {
                module: module.to_string(),
            })?;

        let mut state = slot.state();
        if !state.status.is_cancellable() {
            return Err(UpdateError::CancellationRefused {
                module: module.to_string(),
                status: state.status,
            });
        }
        state.cancel_requested = true;
        info!(module, status = %state.status, "Cancellation requested");
        Ok(state.status)
    }

    fn release(&self, module: &str, slot: &Arc<LockSlot>) {
        let mut slots = self.slots();
        if slots.get(module).is_some_and(|held| Arc::ptr_eq(held, slot)) {
            slots.remove(module);
            debug!(module, "Update lock released");
        }
    }
}

/// Proof of holding a module's update lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct UpdateGuard {
    module: String,
    slot: Arc<LockSlot>,
    locks: UpdateLocks,
}

impl UpdateGuard {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn status(&self) -> UpdateStatus {
        self.slot.state().status
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.slot.state().cancel_requested
    }

    /// Move to `next` unless a cancel is pending.
    ///
    /// Used at every phase boundary up to `BackingUp`; once this succeeds
    /// with `BackingUp`, later cancel requests are refused.
    pub fn checkpoint(&self, next: UpdateStatus) -> Result<(), UpdateError> {
        let mut state = self.slot.state();
        if state.cancel_requested {
            info!(module = %self.module, at = %state.status, "Update cancelled");
            return Err(UpdateError::Cancelled {
                module: self.module.clone(),
            });
        }
        state.status = next;
        Ok(())
    }

    /// Move to `next` regardless of pending cancel requests.
    pub fn set_status(&self, next: UpdateStatus) {
        self.slot.state().status = next;
    }
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        self.locks.release(&self.module, &self.slot);
    }
}
