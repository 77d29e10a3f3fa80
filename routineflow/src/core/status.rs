//! Routine status and the transition table that governs it.

use crate::errors::{InvalidTransitionError, RoutineflowError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The lifecycle status of a routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineStatus {
    /// Created, not yet handed to the queue.
    Pending,
    /// A dispatcher message is on its way.
    Scheduled,
    /// The dispatcher is running the task.
    Running,
    /// The task finished successfully.
    Completed,
    /// The last attempt failed.
    Failed,
    /// A reverter message is on its way.
    Reverting,
    /// The compensating action ran.
    Reverted,
    /// Asked to revert before it ever ran.
    Aborted,
}

impl Default for RoutineStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl RoutineStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 8] = [
        Self::Pending,
        Self::Scheduled,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Reverting,
        Self::Reverted,
        Self::Aborted,
    ];

    /// The lowercase name used in storage and messages.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Reverting => "reverting",
            Self::Reverted => "reverted",
            Self::Aborted => "aborted",
        }
    }

    /// Statuses reachable in a single write from this one.
    #[must_use]
    pub fn allowed_next(&self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Scheduled, Self::Aborted],
            Self::Scheduled => &[Self::Running, Self::Failed, Self::Reverting],
            Self::Running => &[Self::Completed, Self::Failed],
            Self::Completed => &[Self::Reverting],
            Self::Failed => &[Self::Scheduled, Self::Reverting],
            Self::Reverting => &[Self::Reverted],
            Self::Reverted | Self::Aborted => &[],
        }
    }

    /// Returns true if a write may move a routine from `self` to `next`.
    ///
    /// Writes that keep the status unchanged are always allowed.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        *self == next || self.allowed_next().contains(&next)
    }

    /// Returns true if no further transition is possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Returns true once compensation finished or was skipped.
    #[must_use]
    pub fn is_reverted(&self) -> bool {
        matches!(self, Self::Reverted | Self::Aborted)
    }
}

/// Validates the status of a routine about to be created.
///
/// # Errors
///
/// Returns `InvalidInitialStatus` for anything but `pending`.
pub fn ensure_initial(status: RoutineStatus) -> Result<(), RoutineflowError> {
    if status == RoutineStatus::Pending {
        Ok(())
    } else {
        Err(RoutineflowError::InvalidInitialStatus(status))
    }
}

/// Validates a write from the persisted status to the requested one.
///
/// # Errors
///
/// Returns `InvalidTransitionError` when the table forbids the change.
pub fn ensure_transition(
    from: RoutineStatus,
    to: RoutineStatus,
) -> Result<(), InvalidTransitionError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(InvalidTransitionError::new(from, to))
    }
}

impl fmt::Display for RoutineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutineStatus {
    type Err = RoutineflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| RoutineflowError::Internal(format!("Unknown routine status '{s}'")))
    }
}
