//! Repository manager contract.

use crate::core::BuildExecutionConfiguration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome reported by an external collaborator step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    /// Completed successfully.
    Success,
    /// Completed with a failure.
    Failed,
    /// Cancelled before completing.
    Cancelled,
    /// Did not complete in time.
    TimedOut,
    /// An internal fault.
    SystemError,
}

impl CompletionStatus {
    /// Returns true for every outcome other than success.
    #[must_use]
    pub const fn is_failed(self) -> bool {
        !matches!(self, Self::Success)
    }
}

/// Endpoints a build uses to fetch dependencies and deploy artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConnectionInfo {
    /// Dependency download URL.
    pub dependency_url: String,
    /// Artifact deploy URL.
    pub deploy_url: String,
}

/// Artifacts extracted from a build repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryManagerResult {
    /// Extraction outcome.
    pub completion_status: CompletionStatus,
    /// Identifiers of artifacts the build produced.
    #[serde(default)]
    pub built_artifacts: Vec<String>,
    /// Identifiers of artifacts the build downloaded.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl RepositoryManagerResult {
    /// Creates a successful result.
    #[must_use]
    pub fn success(built_artifacts: Vec<String>) -> Self {
        Self {
            completion_status: CompletionStatus::Success,
            built_artifacts,
            dependencies: Vec::new(),
        }
    }

    /// Creates a result with the given status and no artifacts.
    #[must_use]
    pub fn with_status(completion_status: CompletionStatus) -> Self {
        Self {
            completion_status,
            built_artifacts: Vec::new(),
            dependencies: Vec::new(),
        }
    }
}

/// An isolated build repository acquired for one execution.
#[async_trait]
pub trait RepositorySession: Send + Sync {
    /// Repository id, unique per execution.
    fn build_repository_id(&self) -> &str;

    /// Endpoints handed to the build.
    fn connection_info(&self) -> &RepositoryConnectionInfo;

    /// Collects artifacts produced by the build.
    async fn extract_build_artifacts(&self) -> anyhow::Result<RepositoryManagerResult>;
}

/// Creates and releases build repositories.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositoryManager: Send + Sync {
    /// Acquires a build repository for an execution.
    async fn create_build_repository(
        &self,
        execution: &BuildExecutionConfiguration,
        access_token: &str,
    ) -> anyhow::Result<Arc<dyn RepositorySession>>;

    /// Releases resources held for the credential.
    async fn close(&self, access_token: &str) -> anyhow::Result<()>;
}
