//! Error types for the buildflow crate.
//!
//! Every failure the coordinator, executor or environment driver can surface
//! is one variant of [`BuildflowError`]. Collaborator contracts return
//! `anyhow::Result`; those are converted into typed variants at the boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type BuildflowResult<T> = Result<T, BuildflowError>;

/// The main error type for buildflow operations.
#[derive(Debug, Clone, Error)]
pub enum BuildflowError {
    /// An equivalent build is already in flight.
    #[error("{0}")]
    Conflict(#[from] ConflictError),

    /// The submitted task graph or its inputs are malformed.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Environment resources could not be created or never became ready.
    #[error("{0}")]
    Provisioning(#[from] ProvisioningError),

    /// The build driver reported a failed remote build.
    #[error("Remote build failed: {0}")]
    RemoteBuild(String),

    /// Artifact extraction failed after the build itself completed.
    #[error("Result collection failed: {0}")]
    ResultCollection(String),

    /// An unexpected internal fault.
    #[error("System error: {0}")]
    System(String),

    /// An execution session already exists for the id.
    #[error("{0}")]
    AlreadyRunning(#[from] AlreadyRunningError),

    /// The operation was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A polling monitor failed.
    #[error("{0}")]
    Monitor(#[from] MonitorError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BuildflowError {
    /// Creates a system error.
    #[must_use]
    pub fn system(message: impl Into<String>) -> Self {
        Self::System(message.into())
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::new(message))
    }

    /// Creates a remote build error.
    #[must_use]
    pub fn remote_build(message: impl Into<String>) -> Self {
        Self::RemoteBuild(message.into())
    }

    /// Creates a result collection error.
    #[must_use]
    pub fn result_collection(message: impl Into<String>) -> Self {
        Self::ResultCollection(message.into())
    }

    /// Converts a collaborator error into a system error, keeping the cause chain.
    #[must_use]
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self::System(format!("{err:#}"))
    }

    /// Returns the short kind label, useful for structured logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
            Self::Provisioning(_) => "provisioning",
            Self::RemoteBuild(_) => "remote_build",
            Self::ResultCollection(_) => "result_collection",
            Self::System(_) => "system",
            Self::AlreadyRunning(_) => "already_running",
            Self::Cancelled(_) => "cancelled",
            Self::Monitor(_) => "monitor",
            Self::Config(_) => "config",
        }
    }
}

/// Raised when a build for the same configuration revision is already running.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConflictError {
    /// The error message.
    pub message: String,
    /// Id of the task that already holds the configuration revision.
    pub existing_task_id: Option<u32>,
}

impl ConflictError {
    /// Creates a new conflict error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            existing_task_id: None,
        }
    }

    /// Sets the conflicting task id.
    #[must_use]
    pub fn with_existing_task(mut self, task_id: u32) -> Self {
        self.existing_task_id = Some(task_id);
        self
    }
}

/// Raised when a submission cannot be turned into a task graph.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// The error message.
    pub message: String,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Raised by the executor when a session already exists for an execution id.
#[derive(Debug, Clone, Error)]
#[error("Build execution {execution_id} is already running")]
pub struct AlreadyRunningError {
    /// The execution id.
    pub execution_id: u32,
}

/// Whether a provisioning failure may be recovered by recreating the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Transient, eligible for whole-environment recreation.
    Retryable,
    /// Terminal.
    Fatal,
}

/// Operator-facing reason for a provisioning failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningReason {
    /// Resources never became ready in time, usually because the cluster is full.
    CapacityExhausted,
    /// The build image could not be pulled.
    ImagePull,
    /// The compute unit entered a failed phase.
    PodFailed,
    /// A resource creation request was rejected by the backend.
    Creation,
    /// Anything else.
    Other,
}

impl fmt::Display for ProvisioningReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExhausted => write!(f, "capacity_exhausted"),
            Self::ImagePull => write!(f, "image_pull"),
            Self::PodFailed => write!(f, "pod_failed"),
            Self::Creation => write!(f, "creation"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Raised when a build environment cannot be provisioned.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProvisioningError {
    /// Human-readable diagnosis.
    pub message: String,
    /// Failure reason.
    pub reason: ProvisioningReason,
    /// Retry classification.
    pub class: FailureClass,
    /// Number of creation attempts made so far.
    pub attempts: u32,
}

impl ProvisioningError {
    /// Creates a new provisioning error.
    #[must_use]
    pub fn new(message: impl Into<String>, reason: ProvisioningReason, class: FailureClass) -> Self {
        Self {
            message: message.into(),
            reason,
            class,
            attempts: 1,
        }
    }

    /// Sets the number of attempts.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Returns true if the failure may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class == FailureClass::Retryable
    }
}

/// Failure signalled by a polling monitor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    /// The condition did not hold before the timeout elapsed.
    #[error("Condition was not satisfied within {timeout:?}")]
    Timeout {
        /// The configured timeout.
        timeout: Duration,
    },

    /// The condition itself failed.
    #[error("Condition check failed: {0}")]
    Condition(String),

    /// The monitor was cancelled or its owner shut down.
    #[error("Monitor cancelled")]
    Cancelled,
}
