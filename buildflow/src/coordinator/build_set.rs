//! Build set tasks: batches of build tasks submitted together.

use crate::core::{BuildSetId, BuildSetStatus, BuildStatus, TaskId, User};
use crate::events::BuildSetStatusChangedEvent;
use crate::utils::{now_utc, Timestamp};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tokio::sync::watch;

/// A named batch of build tasks with one aggregated status.
///
/// The set keeps the last status of every member, so it can still be
/// inspected after the coordinator released the tasks.
#[derive(Debug)]
pub struct BuildSetTask {
    id: BuildSetId,
    name: String,
    user: User,
    configuration_set_id: Option<u32>,
    submit_time: Timestamp,
    end_time: RwLock<Option<Timestamp>>,
    members: RwLock<BTreeMap<TaskId, BuildStatus>>,
    status: watch::Sender<BuildSetStatus>,
}

impl BuildSetTask {
    /// Creates a set over `task_ids`, all in status NEW.
    #[must_use]
    pub fn new(
        id: BuildSetId,
        name: impl Into<String>,
        user: User,
        configuration_set_id: Option<u32>,
        task_ids: &[TaskId],
    ) -> Self {
        let (status, _) = watch::channel(BuildSetStatus::New);
        Self {
            id,
            name: name.into(),
            user,
            configuration_set_id,
            submit_time: now_utc(),
            end_time: RwLock::new(None),
            members: RwLock::new(task_ids.iter().map(|id| (*id, BuildStatus::New)).collect()),
            status,
        }
    }

    /// Set id.
    #[must_use]
    pub const fn id(&self) -> BuildSetId {
        self.id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submitting user.
    #[must_use]
    pub const fn user(&self) -> &User {
        &self.user
    }

    /// Configuration set the batch was built from, for group builds.
    #[must_use]
    pub const fn configuration_set_id(&self) -> Option<u32> {
        self.configuration_set_id
    }

    /// Submission time.
    #[must_use]
    pub const fn submit_time(&self) -> Timestamp {
        self.submit_time
    }

    /// When every member reached a terminal status.
    #[must_use]
    pub fn end_time(&self) -> Option<Timestamp> {
        *self.end_time.read()
    }

    /// Member task ids, ascending.
    #[must_use]
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.members.read().keys().copied().collect()
    }

    /// Last known status of a member.
    #[must_use]
    pub fn task_status(&self, task_id: TaskId) -> Option<BuildStatus> {
        self.members.read().get(&task_id).copied()
    }

    /// Aggregated status.
    #[must_use]
    pub fn status(&self) -> BuildSetStatus {
        *self.status.borrow()
    }

    /// Whether every member reached a terminal status.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status().is_completed()
    }

    /// Receives every aggregated status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BuildSetStatus> {
        self.status.subscribe()
    }

    /// Waits until every member reached a terminal status.
    pub async fn wait_for_completion(&self) -> BuildSetStatus {
        let mut receiver = self.subscribe();
        let completed = receiver
            .wait_for(|status| status.is_completed())
            .await
            .map(|status| *status);
        completed.unwrap_or_else(|_| self.status())
    }

    /// Records a member's new status and re-aggregates. Returns the change
    /// event when the aggregated status moved.
    pub(crate) fn on_member_status(
        &self,
        task_id: TaskId,
        status: BuildStatus,
    ) -> Option<BuildSetStatusChangedEvent> {
        let aggregated = {
            let mut members = self.members.write();
            let slot = members.get_mut(&task_id)?;
            *slot = status;
            BuildSetStatus::aggregate(members.values().copied())
        };
        let mut old_status = aggregated;
        let changed = self.status.send_if_modified(|current| {
            if *current == aggregated {
                return false;
            }
            old_status = std::mem::replace(current, aggregated);
            true
        });
        if !changed {
            return None;
        }
        if aggregated.is_completed() {
            *self.end_time.write() = Some(now_utc());
        }
        Some(BuildSetStatusChangedEvent {
            build_set_id: self.id,
            name: self.name.clone(),
            old_status,
            new_status: aggregated,
            at: now_utc(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn set() -> BuildSetTask {
        BuildSetTask::new(9, "nightly", User::new(1, "demo"), Some(3), &[1, 2])
    }

    #[test]
    fn test_aggregates_member_changes() {
        let set = set();
        assert_eq!(set.status(), BuildSetStatus::New);

        let event = set.on_member_status(1, BuildStatus::Building).unwrap();
        assert_eq!(event.old_status, BuildSetStatus::New);
        assert_eq!(event.new_status, BuildSetStatus::Running);
        assert!(set.on_member_status(1, BuildStatus::Success).is_none());

        let event = set.on_member_status(2, BuildStatus::Rejected).unwrap();
        assert_eq!(event.new_status, BuildSetStatus::Failed);
        assert!(set.end_time().is_some());
        assert_eq!(set.task_status(2), Some(BuildStatus::Rejected));
    }

    #[test]
    fn test_unknown_member_is_ignored() {
        assert!(set().on_member_status(42, BuildStatus::Success).is_none());
    }

    #[tokio::test]
    async fn test_wait_for_completion() {
        let set = std::sync::Arc::new(set());
        let waiter = {
            let set = set.clone();
            tokio::spawn(async move { set.wait_for_completion().await })
        };
        set.on_member_status(1, BuildStatus::Success);
        set.on_member_status(2, BuildStatus::Success);

        let status = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, BuildSetStatus::Success);
    }
}
