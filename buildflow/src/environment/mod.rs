//! Build environment provisioning.
//!
//! A driver starts an environment and returns at once; the caller then
//! waits for readiness through callbacks. Provisioning recreates failed
//! environments within a bounded budget.

mod backend;
mod classify;
mod driver;
mod probe;
mod provisioned;
mod retry;
mod running;

pub use backend::{
    redact_secrets, BackendError, ComputeBackend, Pod, ResourceNames, ResourceRequest, Route,
    Service, ServicePort, NAME_SUFFIX_LEN, SSH_PORT_NAME,
};
pub use classify::{
    classify_phase, PhaseClass, ProvisioningFailure, FAILED_PHASES, RETRYABLE_PHASES,
    RUNNING_PHASE,
};
pub use driver::{
    EnvironmentDriver, EnvironmentFailed, EnvironmentReady, EnvironmentRequest,
    ProvisioningEnvironmentDriver, StartedEnvironment,
};
#[cfg(feature = "http-probe")]
pub use probe::HttpLivenessProbe;
pub use probe::LivenessProbe;
pub use provisioned::{builder_pod_memory, ProvisionedEnvironment, BUILDER_POD_MEMORY};
pub use retry::{BackoffStrategy, JitterStrategy, RecreationPolicy};
pub use running::{DebugData, DestroyableEnvironment, EnvironmentHandle, RunningEnvironment};
