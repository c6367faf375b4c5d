//! Build record persistence contract.

use super::build_driver::BuildDriverResult;
use super::repository::RepositoryManagerResult;
use crate::core::{BuildStatus, IdRev, TaskId};
use crate::utils::Timestamp;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Final record of a build task, handed to the store once the task is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Task id.
    pub task_id: TaskId,
    /// Configuration revision.
    pub id_rev: IdRev,
    /// Requesting user.
    pub user_id: u32,
    /// Terminal status.
    pub status: BuildStatus,
    /// Status description.
    pub description: Option<String>,
    /// Submission time.
    pub submit_time: Timestamp,
    /// Start time, if the task was ever started.
    pub start_time: Option<Timestamp>,
    /// End time.
    pub end_time: Option<Timestamp>,
    /// Remote build result, if one was captured.
    pub build_driver_result: Option<BuildDriverResult>,
    /// Artifact extraction result, if one was captured.
    pub repository_result: Option<RepositoryManagerResult>,
    /// Result-record-group ids the record is filed under.
    pub build_record_set_ids: Vec<u32>,
}

/// Persists build records. Failures are logged by the caller and never
/// affect task status.
pub trait BuildRecordStore: Send + Sync {
    /// Stores a record.
    fn store(&self, record: BuildRecord) -> anyhow::Result<()>;
}

/// A store that discards records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpBuildRecordStore;

impl BuildRecordStore for NoOpBuildRecordStore {
    fn store(&self, _record: BuildRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A store that keeps records in memory.
#[derive(Debug, Default)]
pub struct InMemoryBuildRecordStore {
    records: RwLock<Vec<BuildRecord>>,
}

impl InMemoryBuildRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every stored record.
    #[must_use]
    pub fn records(&self) -> Vec<BuildRecord> {
        self.records.read().clone()
    }

    /// Returns the record for a task.
    #[must_use]
    pub fn record_for(&self, task_id: TaskId) -> Option<BuildRecord> {
        self.records
            .read()
            .iter()
            .find(|r| r.task_id == task_id)
            .cloned()
    }
}

impl BuildRecordStore for InMemoryBuildRecordStore {
    fn store(&self, record: BuildRecord) -> anyhow::Result<()> {
        self.records.write().push(record);
        Ok(())
    }
}
