//! Status-change notifications.

use crate::core::{BuildExecutionStatus, BuildSetId, BuildSetStatus, BuildStatus, IdRev, TaskId};
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};

/// A build task changed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatusChangedEvent {
    /// Task id.
    pub task_id: TaskId,
    /// Configuration revision of the task.
    pub id_rev: IdRev,
    /// Requesting user.
    pub user_id: u32,
    /// Status before the change.
    pub old_status: BuildStatus,
    /// Status after the change.
    pub new_status: BuildStatus,
    /// Status description, if any.
    pub description: Option<String>,
    /// When the change happened.
    pub at: Timestamp,
}

impl BuildStatusChangedEvent {
    /// Creates a new event stamped with the current time.
    #[must_use]
    pub fn new(
        task_id: TaskId,
        id_rev: IdRev,
        user_id: u32,
        old_status: BuildStatus,
        new_status: BuildStatus,
    ) -> Self {
        Self {
            task_id,
            id_rev,
            user_id,
            old_status,
            new_status,
            description: None,
            at: now_utc(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }
}

/// An execution session changed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildExecutionStatusChangedEvent {
    /// Execution id.
    pub execution_id: TaskId,
    /// Configuration revision being built.
    pub id_rev: IdRev,
    /// Requesting user.
    pub user_id: u32,
    /// Status before the change.
    pub old_status: BuildExecutionStatus,
    /// Status after the change.
    pub new_status: BuildExecutionStatus,
    /// When the change happened.
    pub at: Timestamp,
}

/// A build set's aggregated status changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSetStatusChangedEvent {
    /// Build set id.
    pub build_set_id: BuildSetId,
    /// Display name.
    pub name: String,
    /// Status before the change.
    pub old_status: BuildSetStatus,
    /// Status after the change.
    pub new_status: BuildSetStatus,
    /// When the change happened.
    pub at: Timestamp,
}
