//! Build driver contract.

use crate::core::BuildExecutionConfiguration;
use crate::environment::RunningEnvironment;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Terminal status reported by a remote build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildDriverStatus {
    /// The build succeeded.
    Success,
    /// The build script failed.
    Failed,
    /// The build was cancelled.
    Cancelled,
    /// The driver itself failed.
    SystemError,
}

impl BuildDriverStatus {
    /// Returns true if the build completed successfully.
    #[must_use]
    pub const fn completed_successfully(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result of a remote build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildDriverResult {
    /// Terminal status.
    pub status: BuildDriverStatus,
    /// Driver-specific structured output.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Build log.
    #[serde(default)]
    pub build_log: String,
}

impl BuildDriverResult {
    /// Creates a result with empty output.
    #[must_use]
    pub fn new(status: BuildDriverStatus) -> Self {
        Self {
            status,
            output: serde_json::Value::Null,
            build_log: String::new(),
        }
    }

    /// Sets the structured output.
    #[must_use]
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = output;
        self
    }
}

/// Invoked once when the remote build reports a terminal status.
pub type BuildCompletion = Box<dyn FnOnce(BuildDriverResult) + Send>;

/// Invoked once if the driver loses track of the remote build.
pub type BuildFailure = Box<dyn FnOnce(anyhow::Error) + Send>;

/// Handle over a remote build in progress.
pub trait RunningBuild: Send + Sync {
    /// Asks the remote build to stop. The driver acknowledges through the
    /// completion callback with a cancelled status.
    fn cancel(&self);
}

/// Runs builds inside a running environment.
#[async_trait]
pub trait BuildDriver: Send + Sync {
    /// Starts the build. Exactly one of `on_complete` and `on_error` is
    /// invoked later, possibly from another task.
    async fn start_project_build(
        &self,
        execution: &BuildExecutionConfiguration,
        environment: &RunningEnvironment,
        on_complete: BuildCompletion,
        on_error: BuildFailure,
    ) -> anyhow::Result<Arc<dyn RunningBuild>>;
}
