//! Pod phase classification and provisioning failure diagnosis.

use crate::errors::{FailureClass, MonitorError, ProvisioningError, ProvisioningReason};
use serde::{Deserialize, Serialize};

/// Phase reported by a compute unit that is ready to serve.
pub const RUNNING_PHASE: &str = "Running";

/// Phases after which a compute unit will never become ready.
pub const FAILED_PHASES: &[&str] = &[
    "Failed",
    "Unknown",
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "Error",
    "InvalidImageName",
    "ContainerCannotRun",
];

/// Failed phases worth recreating the environment for.
pub const RETRYABLE_PHASES: &[&str] = &[
    "Failed",
    "Unknown",
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "Error",
    "ContainerCannotRun",
];

const IMAGE_PULL_PHASES: &[&str] = &["ErrImagePull", "ImagePullBackOff", "InvalidImageName"];

/// Classification of a backend-reported compute-unit phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseClass {
    /// Failed, but a fresh environment may succeed.
    Retryable,
    /// Failed for good.
    Fatal,
    /// Not failed; keep polling.
    InProgress,
}

/// Classifies a compute-unit phase.
///
/// Anything outside the failed set, including the running phase, is in progress.
#[must_use]
pub fn classify_phase(phase: &str) -> PhaseClass {
    if !FAILED_PHASES.contains(&phase) {
        PhaseClass::InProgress
    } else if RETRYABLE_PHASES.contains(&phase) {
        PhaseClass::Retryable
    } else {
        PhaseClass::Fatal
    }
}

/// Why one provisioning attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningFailure {
    /// A readiness poll timed out.
    Timeout,
    /// The compute unit entered a failed phase.
    PodFailed {
        /// The reported phase.
        phase: String,
    },
    /// The backend rejected a creation request.
    Creation(String),
    /// A readiness check raised an error.
    Other(String),
    /// Provisioning was cancelled.
    Cancelled,
}

impl ProvisioningFailure {
    /// Converts a monitor outcome, using the phase captured by the pod check if any.
    #[must_use]
    pub fn from_monitor(error: MonitorError, failed_phase: Option<String>) -> Self {
        match (error, failed_phase) {
            (MonitorError::Cancelled, _) => Self::Cancelled,
            (MonitorError::Timeout { .. }, _) => Self::Timeout,
            (MonitorError::Condition(_), Some(phase)) => Self::PodFailed { phase },
            (MonitorError::Condition(message), None) => Self::Other(message),
        }
    }

    /// Retry classification. Only a fatal pod phase is not retryable.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::PodFailed { phase } if classify_phase(phase) == PhaseClass::Fatal => {
                FailureClass::Fatal
            }
            Self::Cancelled => FailureClass::Fatal,
            _ => FailureClass::Retryable,
        }
    }

    /// Operator-facing reason.
    #[must_use]
    pub fn reason(&self) -> ProvisioningReason {
        match self {
            Self::Timeout => ProvisioningReason::CapacityExhausted,
            Self::PodFailed { phase } if IMAGE_PULL_PHASES.contains(&phase.as_str()) => {
                ProvisioningReason::ImagePull
            }
            Self::PodFailed { .. } => ProvisioningReason::PodFailed,
            Self::Creation(_) => ProvisioningReason::Creation,
            Self::Other(_) | Self::Cancelled => ProvisioningReason::Other,
        }
    }

    /// Builds the terminal error. `retries_exhausted` adds the attempt count.
    #[must_use]
    pub fn into_error(self, attempts: u32, retries_exhausted: bool) -> ProvisioningError {
        let reason = self.reason();
        let class = self.class();
        let message = describe(&self, reason, attempts, retries_exhausted);
        ProvisioningError::new(message, reason, class).with_attempts(attempts)
    }
}

fn describe(
    failure: &ProvisioningFailure,
    reason: ProvisioningReason,
    attempts: u32,
    retries_exhausted: bool,
) -> String {
    let mut message =
        String::from("The build environment could not be created.");
    match reason {
        ProvisioningReason::CapacityExhausted => message.push_str(
            " Resources did not become ready before the timeout; the cluster may have no capacity left for new build environments.",
        ),
        ProvisioningReason::ImagePull => message.push_str(
            " The builder image could not be pulled; check the image registry and the configured image name.",
        ),
        ProvisioningReason::PodFailed => message.push_str(
            " The builder pod failed to start; the build scripts or the builder image may be broken.",
        ),
        ProvisioningReason::Creation | ProvisioningReason::Other => {}
    }
    match failure {
        ProvisioningFailure::PodFailed { phase } => {
            message.push_str(&format!(" Last pod phase: {phase}."));
        }
        ProvisioningFailure::Creation(cause) | ProvisioningFailure::Other(cause) => {
            message.push_str(&format!(" Cause: {cause}."));
        }
        ProvisioningFailure::Timeout | ProvisioningFailure::Cancelled => {}
    }
    if retries_exhausted {
        message.push_str(&format!(
            " No retries left after {attempts} attempts; giving up."
        ));
    }
    message
}
