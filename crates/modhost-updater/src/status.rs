//! Update pipeline states and the transitions between them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase of a single update attempt.
///
/// `Completed`, `Failed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Pending,
    Downloading,
    Verifying,
    BackingUp,
    Applying,
    Migrating,
    Seeding,
    HealthChecking,
    Completed,
    Failed,
    RolledBack,
}

use UpdateStatus::*;

impl UpdateStatus {
    /// Every status in pipeline order.
    pub const ALL: [UpdateStatus; 11] = [
        Pending,
        Downloading,
        Verifying,
        BackingUp,
        Applying,
        Migrating,
        Seeding,
        HealthChecking,
        Completed,
        Failed,
        RolledBack,
    ];

    /// Statuses reachable in one step.
    ///
    /// Before files are touched a failure ends in `Failed`. From `Applying`
    /// on, a failure ends in `RolledBack`, or in `Failed` when the rollback
    /// itself could not complete.
    pub fn next_states(self) -> &'static [UpdateStatus] {
        match self {
            Pending => &[Downloading, Failed],
            Downloading => &[Verifying, Failed],
            Verifying => &[BackingUp, Failed],
            BackingUp => &[Applying, Failed],
            Applying => &[Migrating, RolledBack, Failed],
            Migrating => &[Seeding, RolledBack, Failed],
            Seeding => &[HealthChecking, RolledBack, Failed],
            HealthChecking => &[Completed, RolledBack, Failed],
            Completed | Failed | RolledBack => &[],
        }
    }

    pub fn can_transition_to(self, next: UpdateStatus) -> bool {
        self.next_states().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Completed | Failed | RolledBack)
    }

    pub fn is_in_progress(self) -> bool {
        !self.is_terminal()
    }

    /// Whether a cancel request is still honoured. Once backing up starts
    /// the pipeline must run to a terminal state.
    pub fn is_cancellable(self) -> bool {
        matches!(self, Pending | Downloading | Verifying)
    }

    /// Whether the installed module files may have been replaced.
    pub fn touches_files(self) -> bool {
        matches!(self, Applying | Migrating | Seeding | HealthChecking)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Pending => "pending",
            Downloading => "downloading",
            Verifying => "verifying",
            BackingUp => "backing_up",
            Applying => "applying",
            Migrating => "migrating",
            Seeding => "seeding",
            HealthChecking => "health_checking",
            Completed => "completed",
            Failed => "failed",
            RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Presentation
// ============================================================================

/// How a status is shown to an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusStyle {
    pub label: &'static str,
    /// Colour name understood by terminal front ends
    pub colour: &'static str,
}

impl UpdateStatus {
    pub fn style(self) -> StatusStyle {
        let (label, colour) = match self {
            Pending => ("Pending", "grey"),
            Downloading => ("Downloading", "blue"),
            Verifying => ("Verifying", "blue"),
            BackingUp => ("Backing up", "cyan"),
            Applying => ("Applying", "cyan"),
            Migrating => ("Migrating", "cyan"),
            Seeding => ("Seeding", "cyan"),
            HealthChecking => ("Health check", "magenta"),
            Completed => ("Completed", "green"),
            Failed => ("Failed", "red"),
            RolledBack => ("Rolled back", "yellow"),
        };
        StatusStyle { label, colour }
    }
}
