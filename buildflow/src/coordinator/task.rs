//! Build tasks.

use crate::core::{
    BuildConfigurationAudited, BuildExecutionConfiguration, BuildOptions, BuildSetId, BuildStatus,
    IdRev, TaskId, User,
};
use crate::spi::{BuildDriverResult, BuildRecord, RepositoryManagerResult};
use crate::utils::{now_utc, Timestamp};
use std::hash::{Hash, Hasher};

/// One schedulable build of one configuration revision.
///
/// Equality and hashing use the configuration revision only.
#[derive(Debug, Clone)]
pub struct BuildTask {
    /// Task id, also the execution id.
    pub id: TaskId,
    /// Configuration revision being built.
    pub configuration: BuildConfigurationAudited,
    /// Requesting user.
    pub user: User,
    /// Submission options.
    pub options: BuildOptions,
    /// Owning build set.
    pub build_set_id: BuildSetId,
    /// Current status.
    pub status: BuildStatus,
    /// Why the task is in its status, for failures.
    pub status_description: Option<String>,
    /// Submission time.
    pub submit_time: Timestamp,
    /// When the executor picked the task up.
    pub start_time: Option<Timestamp>,
    /// When the task reached a terminal status.
    pub end_time: Option<Timestamp>,
    /// Result-record-group ids to file the result under.
    pub build_record_set_ids: Vec<u32>,
    /// Websocket URL of the live build log while the build runs.
    pub live_logs_uri: Option<String>,
    /// Whether the task ended in a failure status.
    pub failed: bool,
    /// Remote build result reported by the executor.
    pub build_driver_result: Option<BuildDriverResult>,
    /// Artifact extraction result reported by the executor.
    pub repository_result: Option<RepositoryManagerResult>,
    pub(crate) execution_started: bool,
    pub(crate) cancel_requested: bool,
}

impl BuildTask {
    /// Creates a task in status NEW.
    #[must_use]
    pub fn new(
        id: TaskId,
        configuration: BuildConfigurationAudited,
        user: User,
        options: BuildOptions,
        build_set_id: BuildSetId,
        build_record_set_ids: Vec<u32>,
    ) -> Self {
        Self {
            id,
            configuration,
            user,
            options,
            build_set_id,
            status: BuildStatus::New,
            status_description: None,
            submit_time: now_utc(),
            start_time: None,
            end_time: None,
            build_record_set_ids,
            live_logs_uri: None,
            failed: false,
            build_driver_result: None,
            repository_result: None,
            execution_started: false,
            cancel_requested: false,
        }
    }

    /// Configuration revision identity.
    #[must_use]
    pub const fn id_rev(&self) -> IdRev {
        self.configuration.id_rev
    }

    /// Whether the task reached a terminal status.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    /// Whether the task still waits for the executor or its dependencies.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(
            self.status,
            BuildStatus::New | BuildStatus::WaitingForDependencies
        )
    }

    /// What the executor needs to run this task.
    #[must_use]
    pub fn execution_configuration(&self) -> BuildExecutionConfiguration {
        BuildExecutionConfiguration::for_task(self.id, &self.configuration, &self.user, self.options)
    }

    /// The record persisted for a terminal task.
    #[must_use]
    pub fn record(&self) -> BuildRecord {
        BuildRecord {
            task_id: self.id,
            id_rev: self.id_rev(),
            user_id: self.user.id,
            status: self.status,
            description: self.status_description.clone(),
            submit_time: self.submit_time,
            start_time: self.start_time,
            end_time: self.end_time,
            build_driver_result: self.build_driver_result.clone(),
            repository_result: self.repository_result.clone(),
            build_record_set_ids: self.build_record_set_ids.clone(),
        }
    }
}

impl PartialEq for BuildTask {
    fn eq(&self, other: &Self) -> bool {
        self.id_rev() == other.id_rev()
    }
}

impl Eq for BuildTask {}

impl Hash for BuildTask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id_rev().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn task(id: TaskId, configuration: u32, rev: u32) -> BuildTask {
        BuildTask::new(
            id,
            BuildConfigurationAudited::new(configuration, rev, "lib"),
            User::new(1, "demo"),
            BuildOptions::default().with_keep_pod_on_failure(true),
            1,
            vec![5],
        )
    }

    #[test]
    fn test_equality_by_configuration_revision() {
        assert_eq!(task(1, 10, 2), task(2, 10, 2));
        assert_ne!(task(1, 10, 2), task(1, 10, 3));

        let unique: HashSet<_> = [task(1, 10, 2), task(2, 10, 2), task(3, 11, 1)]
            .into_iter()
            .collect();
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn test_execution_configuration_carries_options() {
        let execution = task(4, 10, 2).execution_configuration();
        assert_eq!(execution.id, 4);
        assert_eq!(execution.id_rev, IdRev::new(10, 2));
        assert!(execution.keep_pod_on_failure);
        assert_eq!(execution.user_id, 1);
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = task(1, 10, 2);
        assert!(task.is_pending());
        assert!(!task.is_completed());
        assert_eq!(task.record().build_record_set_ids, vec![5]);
    }
}
