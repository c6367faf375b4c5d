//! Build, execution and build-set status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse status of a build task as tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    /// Created, not yet evaluated.
    New,
    /// At least one dependency has not completed yet.
    WaitingForDependencies,
    /// Handed to the executor.
    Enqueued,
    /// The execution pipeline is running.
    Building,
    /// Built successfully.
    Success,
    /// The remote build or its result collection failed.
    Failed,
    /// A dependency failed; never started.
    Rejected,
    /// An internal fault prevented the build.
    SystemError,
    /// Cancelled by a user.
    Cancelled,
}

impl Default for BuildStatus {
    fn default() -> Self {
        Self::New
    }
}

impl BuildStatus {
    /// Returns true for the five terminal states.
    #[must_use]
    pub const fn is_completed(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Rejected | Self::SystemError | Self::Cancelled
        )
    }

    /// Returns true for terminal states other than success.
    ///
    /// Any of these cascades `Rejected` to dependants.
    #[must_use]
    pub const fn has_failed(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Rejected | Self::SystemError | Self::Cancelled
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::WaitingForDependencies => "WAITING_FOR_DEPENDENCIES",
            Self::Enqueued => "ENQUEUED",
            Self::Building => "BUILDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Rejected => "REJECTED",
            Self::SystemError => "SYSTEM_ERROR",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Fine-grained status of one execution session, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildExecutionStatus {
    /// Session created.
    New,
    /// Acquiring the build repository session.
    RepoSettingUp,
    /// Asking the environment driver for an environment.
    BuildEnvSettingUp,
    /// Waiting for the environment to become ready.
    BuildEnvWaiting,
    /// The environment is ready.
    BuildEnvSetupCompleteSuccess,
    /// The environment failed to come up.
    BuildEnvSetupCompleteWithError,
    /// Starting the remote build.
    BuildSettingUp,
    /// Waiting for the remote build.
    BuildWaiting,
    /// The remote build succeeded.
    BuildCompletedSuccess,
    /// The remote build failed.
    BuildCompletedWithError,
    /// Collecting the build driver's results.
    CollectingResultsFromBuildDriver,
    /// Collecting artifacts from the repository manager.
    CollectingResultsFromRepositoryManager,
    /// Artifacts collected.
    CollectingResultsFromRepositoryManagerCompletedSuccess,
    /// Artifact collection failed.
    CollectingResultsFromRepositoryManagerCompletedWithError,
    /// Finalization started.
    FinalizingExecution,
    /// Tearing down the environment.
    BuildEnvDestroying,
    /// Environment torn down.
    BuildEnvDestroyed,
    /// Finished without errors.
    Done,
    /// Finished with a captured failure.
    DoneWithErrors,
    /// Cancelled; emitted for the remote build result and as the final status.
    Cancelled,
}

impl Default for BuildExecutionStatus {
    fn default() -> Self {
        Self::New
    }
}

impl BuildExecutionStatus {
    /// Returns true for statuses that report a failed step.
    #[must_use]
    pub const fn has_failed(self) -> bool {
        matches!(
            self,
            Self::BuildEnvSetupCompleteWithError
                | Self::BuildCompletedWithError
                | Self::CollectingResultsFromRepositoryManagerCompletedWithError
                | Self::DoneWithErrors
        )
    }

    /// Returns true for the statuses that end a session.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Done | Self::DoneWithErrors)
    }
}

impl fmt::Display for BuildExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::RepoSettingUp => "REPO_SETTING_UP",
            Self::BuildEnvSettingUp => "BUILD_ENV_SETTING_UP",
            Self::BuildEnvWaiting => "BUILD_ENV_WAITING",
            Self::BuildEnvSetupCompleteSuccess => "BUILD_ENV_SETUP_COMPLETE_SUCCESS",
            Self::BuildEnvSetupCompleteWithError => "BUILD_ENV_SETUP_COMPLETE_WITH_ERROR",
            Self::BuildSettingUp => "BUILD_SETTING_UP",
            Self::BuildWaiting => "BUILD_WAITING",
            Self::BuildCompletedSuccess => "BUILD_COMPLETED_SUCCESS",
            Self::BuildCompletedWithError => "BUILD_COMPLETED_WITH_ERROR",
            Self::CollectingResultsFromBuildDriver => "COLLECTING_RESULTS_FROM_BUILD_DRIVER",
            Self::CollectingResultsFromRepositoryManager => {
                "COLLECTING_RESULTS_FROM_REPOSITORY_MANAGER"
            }
            Self::CollectingResultsFromRepositoryManagerCompletedSuccess => {
                "COLLECTING_RESULTS_FROM_REPOSITORY_MANAGER_COMPLETED_SUCCESS"
            }
            Self::CollectingResultsFromRepositoryManagerCompletedWithError => {
                "COLLECTING_RESULTS_FROM_REPOSITORY_MANAGER_COMPLETED_WITH_ERROR"
            }
            Self::FinalizingExecution => "FINALIZING_EXECUTION",
            Self::BuildEnvDestroying => "BUILD_ENV_DESTROYING",
            Self::BuildEnvDestroyed => "BUILD_ENV_DESTROYED",
            Self::Done => "DONE",
            Self::DoneWithErrors => "DONE_WITH_ERRORS",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Aggregated status of a build set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildSetStatus {
    /// No member has started.
    New,
    /// At least one member is in flight.
    Running,
    /// Every member succeeded.
    Success,
    /// Every member finished and at least one did not succeed.
    Failed,
    /// Every member finished and at least one was cancelled.
    Cancelled,
}

impl Default for BuildSetStatus {
    fn default() -> Self {
        Self::New
    }
}

impl BuildSetStatus {
    /// Returns true once every member has finished.
    #[must_use]
    pub const fn is_completed(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Aggregates member statuses.
    ///
    /// Cancellation takes precedence over failure once every member is done.
    #[must_use]
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = BuildStatus>,
    {
        let mut any = false;
        let mut all_done = true;
        let mut any_started = false;
        let mut any_cancelled = false;
        let mut any_failed = false;
        for status in statuses {
            any = true;
            all_done &= status.is_completed();
            any_started |= status != BuildStatus::New;
            any_cancelled |= status == BuildStatus::Cancelled;
            any_failed |= status.has_failed();
        }
        if !any {
            return Self::New;
        }
        if all_done {
            if any_cancelled {
                Self::Cancelled
            } else if any_failed {
                Self::Failed
            } else {
                Self::Success
            }
        } else if any_started {
            Self::Running
        } else {
            Self::New
        }
    }
}

impl fmt::Display for BuildSetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}
