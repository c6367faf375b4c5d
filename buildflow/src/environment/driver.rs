//! Environment driver contracts and the provisioning driver.

use super::backend::ComputeBackend;
use super::probe::LivenessProbe;
use super::provisioned::{builder_pod_memory, ProvisionedEnvironment};
use super::running::{DebugData, DestroyableEnvironment, RunningEnvironment};
use crate::config::{EnvironmentConfig, MonitorConfig};
use crate::errors::{BuildflowError, BuildflowResult};
use crate::monitor::PollingMonitor;
use crate::spi::RepositorySession;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Invoked once when initialization ends without error. `None` means the
/// environment was cancelled before it became ready.
pub type EnvironmentReady = Box<dyn FnOnce(Option<RunningEnvironment>) + Send>;

/// Invoked once when initialization fails for good.
pub type EnvironmentFailed = Box<dyn FnOnce(BuildflowError) + Send>;

/// Inputs for starting an environment.
#[derive(Clone)]
pub struct EnvironmentRequest {
    /// Builder image; the driver default is used when absent.
    pub image_id: Option<String>,
    /// Repository session the build will use.
    pub repository_session: Arc<dyn RepositorySession>,
    /// Debug settings.
    pub debug: Arc<DebugData>,
    /// Credential forwarded to the build agent.
    pub access_token: String,
    /// Whether the build is temporary.
    pub temporary_build: bool,
    /// Build parameters; `BUILDER_POD_MEMORY` overrides the builder memory.
    pub parameters: HashMap<String, String>,
}

impl std::fmt::Debug for EnvironmentRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentRequest")
            .field("image_id", &self.image_id)
            .field("build_repository_id", &self.repository_session.build_repository_id())
            .field("temporary_build", &self.temporary_build)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// An environment whose provisioning has been started.
pub trait StartedEnvironment: Send + Sync {
    /// Identity of the current compute unit.
    fn id(&self) -> String;

    /// Starts waiting for readiness. Exactly one of the callbacks runs.
    fn monitor_initialization(&self, on_complete: EnvironmentReady, on_error: EnvironmentFailed);

    /// Aborts provisioning and tears down whatever exists. Idempotent.
    fn cancel(&self);

    /// The environment as something the executor can destroy on failure.
    fn destroyable(&self) -> Arc<dyn DestroyableEnvironment>;
}

/// Starts build environments.
pub trait EnvironmentDriver: Send + Sync {
    /// Begins provisioning and returns immediately.
    fn start_environment(
        &self,
        request: EnvironmentRequest,
    ) -> BuildflowResult<Arc<dyn StartedEnvironment>>;
}

/// Provisions environments on a [`ComputeBackend`].
pub struct ProvisioningEnvironmentDriver {
    backend: Arc<dyn ComputeBackend>,
    probe: Arc<dyn LivenessProbe>,
    monitor: PollingMonitor,
    config: EnvironmentConfig,
}

impl ProvisioningEnvironmentDriver {
    /// Creates a driver with its own polling monitor.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        probe: Arc<dyn LivenessProbe>,
        config: EnvironmentConfig,
    ) -> Self {
        Self::with_monitor(backend, probe, config, PollingMonitor::new(MonitorConfig::default()))
    }

    /// Creates a driver sharing an existing polling monitor.
    #[must_use]
    pub fn with_monitor(
        backend: Arc<dyn ComputeBackend>,
        probe: Arc<dyn LivenessProbe>,
        config: EnvironmentConfig,
        monitor: PollingMonitor,
    ) -> Self {
        Self {
            backend,
            probe,
            monitor,
            config,
        }
    }

    /// The monitor readiness polls are registered with.
    #[must_use]
    pub const fn monitor(&self) -> &PollingMonitor {
        &self.monitor
    }
}

impl EnvironmentDriver for ProvisioningEnvironmentDriver {
    fn start_environment(
        &self,
        request: EnvironmentRequest,
    ) -> BuildflowResult<Arc<dyn StartedEnvironment>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BuildflowError::system(format!("no async runtime available: {e}")))?;
        let memory = builder_pod_memory(self.config.builder_pod_memory_gib, &request.parameters)?;
        let image = request
            .image_id
            .clone()
            .unwrap_or_else(|| self.config.image_id.clone());
        info!(image = %image, memory = %memory, "Creating new build environment");

        let environment = ProvisionedEnvironment::start(
            runtime,
            self.backend.clone(),
            self.probe.clone(),
            self.monitor.clone(),
            self.config.clone(),
            image,
            memory,
            request,
        );
        Ok(Arc::new(environment))
    }
}

impl std::fmt::Debug for ProvisioningEnvironmentDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningEnvironmentDriver")
            .field("config", &self.config)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}
