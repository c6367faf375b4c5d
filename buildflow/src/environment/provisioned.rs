//! Provisioning of one build environment on a compute backend.
//!
//! An environment is a compute unit, an internal service and optionally a
//! public route, all sharing one random name suffix. Readiness is polled
//! through the shared [`PollingMonitor`]; a retryable failure tears the
//! attempt down and starts over with fresh names until the recreation
//! budget is spent.

use super::backend::{
    BackendError, ComputeBackend, Pod, ResourceNames, ResourceRequest, Route, Service,
    SSH_PORT_NAME,
};
use super::classify::{classify_phase, PhaseClass, ProvisioningFailure, RUNNING_PHASE};
use super::driver::{EnvironmentFailed, EnvironmentReady, EnvironmentRequest, StartedEnvironment};
use super::probe::LivenessProbe;
use super::running::{DebugData, DestroyableEnvironment, EnvironmentHandle, RunningEnvironment};
use crate::config::EnvironmentConfig;
use crate::errors::{BuildflowError, BuildflowResult, FailureClass, ValidationError};
use crate::monitor::{MonitorCanceller, MonitorHandle, PollingMonitor};
use crate::observability::environment_span;
use crate::spi::RepositorySession;
use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Build parameter overriding the builder memory, in GiB.
pub const BUILDER_POD_MEMORY: &str = "BUILDER_POD_MEMORY";

/// Memory limit for the builder, e.g. `4096Mi`.
///
/// A positive [`BUILDER_POD_MEMORY`] parameter wins over the default. The
/// value is rounded up to whole MiB.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn builder_pod_memory(
    default_gib: f64,
    parameters: &HashMap<String, String>,
) -> BuildflowResult<String> {
    let gib = match parameters.get(BUILDER_POD_MEMORY) {
        Some(raw) => {
            let parsed: f64 = raw.trim().parse().map_err(|_| {
                ValidationError::new(format!(
                    "{BUILDER_POD_MEMORY} must be a number of GiB, got '{raw}'"
                ))
            })?;
            if !parsed.is_finite() || parsed <= 0.0 {
                return Err(ValidationError::new(format!(
                    "{BUILDER_POD_MEMORY} must be positive, got '{raw}'"
                ))
                .into());
            }
            parsed
        }
        None => default_gib,
    };
    let mib = (gib * 1024.0).ceil() as u64;
    Ok(format!("{mib}Mi"))
}

type Creation = Shared<BoxFuture<'static, Result<(), String>>>;

#[derive(Debug, Default)]
struct Resources {
    pod: Option<Pod>,
    service: Option<Service>,
    route: Option<Route>,
    ssh_service: Option<Service>,
}

struct Attempt {
    number: u32,
    request: ResourceRequest,
    resources: Resources,
    creation: Option<Creation>,
}

struct Callbacks {
    on_complete: EnvironmentReady,
    on_error: EnvironmentFailed,
}

struct Provisioning {
    runtime: tokio::runtime::Handle,
    backend: Arc<dyn ComputeBackend>,
    probe: Arc<dyn LivenessProbe>,
    monitor: PollingMonitor,
    config: EnvironmentConfig,
    base_variables: BTreeMap<String, String>,
    image: String,
    memory: String,
    repository_session: Arc<dyn RepositorySession>,
    debug: Arc<DebugData>,
    attempt: Mutex<Attempt>,
    cancel_requested: AtomicBool,
    initializing: AtomicBool,
    monitors: Mutex<Vec<MonitorCanceller>>,
    callbacks: Mutex<Option<Callbacks>>,
}

/// An environment being provisioned, and later the handle behind its
/// [`RunningEnvironment`].
pub struct ProvisionedEnvironment {
    core: Arc<Provisioning>,
}

impl ProvisionedEnvironment {
    /// Starts creating resources on `runtime`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        runtime: tokio::runtime::Handle,
        backend: Arc<dyn ComputeBackend>,
        probe: Arc<dyn LivenessProbe>,
        monitor: PollingMonitor,
        config: EnvironmentConfig,
        image: String,
        memory: String,
        request: EnvironmentRequest,
    ) -> Self {
        let base_variables = base_variables(&config, &image, &memory, &request);
        let names = ResourceNames::generate(&config.resource_prefix);
        let first = resource_request(&config, &image, &memory, &base_variables, names);
        let core = Arc::new(Provisioning {
            runtime,
            backend,
            probe,
            monitor,
            config,
            base_variables,
            image,
            memory,
            repository_session: request.repository_session,
            debug: request.debug,
            attempt: Mutex::new(Attempt {
                number: 1,
                request: first,
                resources: Resources::default(),
                creation: None,
            }),
            cancel_requested: AtomicBool::new(false),
            initializing: AtomicBool::new(false),
            monitors: Mutex::new(Vec::new()),
            callbacks: Mutex::new(None),
        });
        core.begin_attempt(None);
        Self { core }
    }
}

impl StartedEnvironment for ProvisionedEnvironment {
    fn id(&self) -> String {
        self.core.attempt.lock().request.names.pod.clone()
    }

    fn monitor_initialization(&self, on_complete: EnvironmentReady, on_error: EnvironmentFailed) {
        if self.core.initializing.swap(true, Ordering::SeqCst) {
            on_error(BuildflowError::system(
                "environment initialization is already being monitored",
            ));
            return;
        }
        *self.core.callbacks.lock() = Some(Callbacks {
            on_complete,
            on_error,
        });
        if self.core.is_cancel_requested() {
            self.core.finish_cancelled();
            return;
        }
        let core = self.core.clone();
        self.core.runtime.spawn(core.provision());
    }

    fn cancel(&self) {
        self.core.cancel();
    }

    fn destroyable(&self) -> Arc<dyn DestroyableEnvironment> {
        self.core.clone()
    }
}

impl std::fmt::Debug for ProvisionedEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attempt = self.core.attempt.lock();
        f.debug_struct("ProvisionedEnvironment")
            .field("pod", &attempt.request.names.pod)
            .field("attempt", &attempt.number)
            .field("image", &self.core.image)
            .field("memory", &self.core.memory)
            .field("cancel_requested", &self.core.is_cancel_requested())
            .finish_non_exhaustive()
    }
}

fn base_variables(
    config: &EnvironmentConfig,
    image: &str,
    memory: &str,
    request: &EnvironmentRequest,
) -> BTreeMap<String, String> {
    let session = &request.repository_session;
    let mut variables = BTreeMap::new();
    variables.insert("image".to_string(), image.to_string());
    variables.insert("containerPort".to_string(), config.container_port.to_string());
    variables.insert(
        "dependencyUrl".to_string(),
        session.connection_info().dependency_url.clone(),
    );
    variables.insert(
        "deployUrl".to_string(),
        session.connection_info().deploy_url.clone(),
    );
    variables.insert(
        "buildContentId".to_string(),
        session.build_repository_id().to_string(),
    );
    variables.insert("accessToken".to_string(), request.access_token.clone());
    variables.insert("tempBuild".to_string(), request.temporary_build.to_string());
    variables.insert("resourcesMemory".to_string(), memory.to_string());
    if request.debug.is_enable_debug_on_failure() {
        variables.insert(
            "workerUserPassword".to_string(),
            request.debug.generate_ssh_password(),
        );
    }
    variables
}

fn resource_request(
    config: &EnvironmentConfig,
    image: &str,
    memory: &str,
    base: &BTreeMap<String, String>,
    names: ResourceNames,
) -> ResourceRequest {
    let mut variables = base.clone();
    variables.insert("podName".to_string(), names.pod.clone());
    variables.insert("serviceName".to_string(), names.service.clone());
    variables.insert("sshServiceName".to_string(), names.ssh_service.clone());
    variables.insert("routeName".to_string(), names.route.clone());
    variables.insert("routePath".to_string(), format!("/{}", names.context_path));
    variables.insert(
        "buildAgentContextPath".to_string(),
        format!("/{}", names.context_path),
    );
    ResourceRequest {
        names,
        image: image.to_string(),
        memory: memory.to_string(),
        container_port: config.container_port,
        variables,
    }
}

fn record_deletion(
    result: Result<(), BackendError>,
    kind: &str,
    name: &str,
    first_error: &mut Option<anyhow::Error>,
) {
    match result {
        Ok(()) => debug!(kind, name, "Deleted environment resource"),
        Err(BackendError::NotFound(_)) => {
            warn!(kind, name, "Environment resource already gone");
        }
        Err(e) => {
            warn!(kind, name, error = %e, "Cannot delete environment resource");
            if first_error.is_none() {
                *first_error = Some(anyhow!("cannot delete {kind} {name}: {e}"));
            }
        }
    }
}

impl Provisioning {
    fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn bind_path(&self) -> &str {
        self.config.build_agent_bind_path.trim_start_matches('/')
    }

    /// Spawns resource creation for the current attempt, or for a fresh one
    /// when `names` is given. Returns false if cancellation won the race.
    fn begin_attempt(self: &Arc<Self>, names: Option<ResourceNames>) -> bool {
        let mut attempt = self.attempt.lock();
        if self.is_cancel_requested() {
            return false;
        }
        if let Some(names) = names {
            attempt.number += 1;
            attempt.request = resource_request(
                &self.config,
                &self.image,
                &self.memory,
                &self.base_variables,
                names,
            );
        }
        let request = attempt.request.clone();
        let core = self.clone();
        let creating = self
            .runtime
            .spawn(async move { core.create_resources(&request).await });
        attempt.creation = Some(
            async move {
                creating
                    .await
                    .unwrap_or_else(|e| Err(format!("resource creation task failed: {e}")))
            }
            .boxed()
            .shared(),
        );
        true
    }

    async fn create_resources(&self, request: &ResourceRequest) -> Result<(), String> {
        debug!(request = %request.to_log_string(), "Creating environment resources");
        let pod = async {
            let pod = self.backend.create_pod(request).await?;
            self.attempt.lock().resources.pod = Some(pod);
            Ok::<_, BackendError>(())
        };
        let service = async {
            let service = self.backend.create_service(request).await?;
            self.attempt.lock().resources.service = Some(service);
            Ok::<_, BackendError>(())
        };
        let route = async {
            if !self.config.expose_build_agent_on_public_url {
                return Ok::<_, BackendError>(());
            }
            let route = self.backend.create_route(request).await?;
            self.attempt.lock().resources.route = Some(route);
            Ok(())
        };
        let (pod, service, route) = tokio::join!(pod, service, route);
        pod.and(service)
            .and(route)
            .map_err(|e| format!("cannot create environment {}: {e}", request.names.pod))
    }

    fn watch<F, Fut>(&self, condition: F) -> Result<MonitorHandle, ProvisioningFailure>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let handle = self.monitor.monitor(
            condition,
            self.config.readiness_check_interval(),
            self.config.readiness_timeout(),
        );
        let mut monitors = self.monitors.lock();
        if self.is_cancel_requested() {
            handle.cancel();
            return Err(ProvisioningFailure::Cancelled);
        }
        monitors.push(handle.canceller());
        Ok(handle)
    }

    fn cancel_monitors(&self) {
        let monitors = std::mem::take(&mut *self.monitors.lock());
        for monitor in monitors {
            monitor.cancel();
        }
    }

    fn internal_url(&self) -> Option<String> {
        let attempt = self.attempt.lock();
        let ip = attempt.resources.service.as_ref()?.cluster_ip.clone()?;
        Some(format!(
            "http://{ip}/{}/{}",
            attempt.request.names.context_path,
            self.bind_path()
        ))
    }

    fn public_url(&self) -> Option<String> {
        let attempt = self.attempt.lock();
        let route = attempt.resources.route.as_ref()?;
        Some(format!("http://{}{}/{}", route.host, route.path, self.bind_path()))
    }

    async fn await_ready(self: &Arc<Self>) -> Result<RunningEnvironment, ProvisioningFailure> {
        let creation = self.attempt.lock().creation.clone();
        if let Some(creation) = creation {
            creation.await.map_err(ProvisioningFailure::Creation)?;
        }
        if self.is_cancel_requested() {
            return Err(ProvisioningFailure::Cancelled);
        }

        let names = self.attempt.lock().request.names.clone();
        let failed_phase = Arc::new(Mutex::new(None::<String>));
        let mut readiness = Vec::with_capacity(3);

        let (backend, pod_name, phase_slot) =
            (self.backend.clone(), names.pod.clone(), failed_phase.clone());
        readiness.push(self.watch(move || {
            let (backend, pod_name, phase_slot) =
                (backend.clone(), pod_name.clone(), phase_slot.clone());
            async move {
                let pod = backend.get_pod(&pod_name).await?;
                debug!(pod = %pod.name, phase = %pod.phase, "Pod status");
                if pod.phase == RUNNING_PHASE {
                    return Ok(true);
                }
                match classify_phase(&pod.phase) {
                    PhaseClass::InProgress => Ok(false),
                    PhaseClass::Retryable | PhaseClass::Fatal => {
                        *phase_slot.lock() = Some(pod.phase.clone());
                        Err(anyhow!("pod {} failed with phase {}", pod.name, pod.phase))
                    }
                }
            }
        })?);

        let (core, service_name) = (self.clone(), names.service.clone());
        readiness.push(self.watch(move || {
            let (core, service_name) = (core.clone(), service_name.clone());
            async move {
                let service = core.backend.get_service(&service_name).await?;
                let ready = service.cluster_ip.is_some();
                debug!(service = %service.name, ready, "Service status");
                core.attempt.lock().resources.service = Some(service);
                Ok(ready)
            }
        })?);

        if self.config.expose_build_agent_on_public_url {
            let (core, route_name) = (self.clone(), names.route.clone());
            readiness.push(self.watch(move || {
                let (core, route_name) = (core.clone(), route_name.clone());
                async move {
                    let Some(url) = core.public_url() else {
                        return Ok(false);
                    };
                    if !core.probe.is_alive(&url).await {
                        return Ok(false);
                    }
                    let route = core.backend.get_route(&route_name).await?;
                    debug!(route = %route.name, url = %url, "Route is serving");
                    core.attempt.lock().resources.route = Some(route);
                    Ok(true)
                }
            })?);
        }

        futures::future::try_join_all(readiness)
            .await
            .map_err(|e| ProvisioningFailure::from_monitor(e, failed_phase.lock().clone()))?;

        let internal_url = self.internal_url().ok_or_else(|| {
            ProvisioningFailure::Other(format!("service {} has no cluster address", names.service))
        })?;
        let (probe, agent_url) = (self.probe.clone(), internal_url.clone());
        let agent = self.watch(move || {
            let (probe, agent_url) = (probe.clone(), agent_url.clone());
            async move { Ok(probe.is_alive(&agent_url).await) }
        })?;
        agent
            .await
            .map_err(|e| ProvisioningFailure::from_monitor(e, None))?;

        let build_agent_url = self.public_url().unwrap_or_else(|| internal_url.clone());
        Ok(RunningEnvironment::new(
            names.pod,
            self.config.container_port,
            build_agent_url,
            internal_url,
            self.repository_session.clone(),
            self.config.working_directory.clone(),
            self.debug.clone(),
            self.clone(),
        ))
    }

    async fn provision(self: Arc<Self>) {
        let mut retries_left = self.config.recreation.max_retries;
        loop {
            let (number, pod) = {
                let attempt = self.attempt.lock();
                (attempt.number, attempt.request.names.pod.clone())
            };
            let outcome = self
                .await_ready()
                .instrument(environment_span(&pod, number))
                .await;

            let failure = match outcome {
                Ok(environment) => {
                    info!(pod = %environment.id, url = %environment.build_agent_url, "Build environment is ready");
                    self.finish_ready(environment);
                    return;
                }
                Err(failure) => failure,
            };
            self.cancel_monitors();

            if failure == ProvisioningFailure::Cancelled || self.is_cancel_requested() {
                info!(pod = %pod, "Environment provisioning cancelled");
                self.finish_cancelled();
                return;
            }
            if retries_left == 0 {
                self.finish_failed(failure.into_error(number, true));
                return;
            }
            if failure.class() == FailureClass::Fatal {
                self.finish_failed(failure.into_error(number, false));
                return;
            }

            warn!(
                pod = %pod,
                attempt = number,
                retries_left,
                failure = ?failure,
                "Build environment failed, recreating"
            );
            let stale = std::mem::take(&mut self.attempt.lock().resources);
            if let Err(e) = self.delete_resources(stale).await {
                warn!(pod = %pod, error = %format!("{e:#}"), "Cannot fully remove failed environment");
            }
            let delay = self.config.recreation.delay_for(number - 1);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            retries_left -= 1;
            if !self.begin_attempt(Some(ResourceNames::generate(&self.config.resource_prefix))) {
                self.finish_cancelled();
                return;
            }
        }
    }

    fn take_callbacks(&self) -> Option<Callbacks> {
        self.callbacks.lock().take()
    }

    fn finish_ready(&self, environment: RunningEnvironment) {
        if let Some(callbacks) = self.take_callbacks() {
            (callbacks.on_complete)(Some(environment));
        }
    }

    fn finish_cancelled(&self) {
        if let Some(callbacks) = self.take_callbacks() {
            (callbacks.on_complete)(None);
        }
    }

    fn finish_failed(&self, error: crate::errors::ProvisioningError) {
        warn!(reason = %error.reason, attempts = error.attempts, "{}", error.message);
        if let Some(callbacks) = self.take_callbacks() {
            (callbacks.on_error)(BuildflowError::Provisioning(error));
        }
    }

    fn cancel(self: &Arc<Self>) {
        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_monitors();
        match self.take_callbacks() {
            Some(callbacks) => (callbacks.on_complete)(None),
            None => warn!("Environment cancelled while nobody is waiting for it"),
        }
        let core = self.clone();
        self.runtime.spawn(async move {
            let creation = core.attempt.lock().creation.clone();
            if let Some(creation) = creation {
                // Whatever got created must go, even if creation failed halfway.
                let _ = creation.await;
            }
            if let Err(e) = core.destroy(false).await {
                warn!(error = %format!("{e:#}"), "Cannot tear down cancelled environment");
            }
        });
    }

    async fn destroy(&self, force: bool) -> anyhow::Result<()> {
        if !force && self.config.keep_build_agent_instance {
            info!("Keeping build environment, instance retention is configured");
            return Ok(());
        }
        if !force && self.debug.is_debug_enabled() {
            info!("Keeping build environment, debugging is enabled");
            return Ok(());
        }
        let resources = std::mem::take(&mut self.attempt.lock().resources);
        self.delete_resources(resources).await
    }

    async fn delete_resources(&self, resources: Resources) -> anyhow::Result<()> {
        let mut first_error = None;
        if let Some(route) = resources.route {
            let result = self.backend.delete_route(&route.name).await;
            record_deletion(result, "route", &route.name, &mut first_error);
        }
        if let Some(service) = resources.service {
            let result = self.backend.delete_service(&service.name).await;
            record_deletion(result, "service", &service.name, &mut first_error);
        }
        if let Some(ssh) = resources.ssh_service {
            let result = self.backend.delete_service(&ssh.name).await;
            record_deletion(result, "ssh service", &ssh.name, &mut first_error);
        }
        if let Some(pod) = resources.pod {
            let result = self.backend.delete_pod(&pod.name).await;
            record_deletion(result, "pod", &pod.name, &mut first_error);
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl DestroyableEnvironment for Provisioning {
    async fn destroy_environment(&self) -> anyhow::Result<()> {
        self.destroy(false).await
    }
}

#[async_trait]
impl EnvironmentHandle for Provisioning {
    async fn enable_ssh(&self) -> anyhow::Result<()> {
        let request = self.attempt.lock().request.clone();
        let service = self
            .backend
            .create_ssh_service(&request)
            .await
            .with_context(|| format!("cannot create ssh service for {}", request.names.pod))?;
        self.attempt.lock().resources.ssh_service = Some(service.clone());

        let port = service
            .ports
            .iter()
            .find(|port| port.name == SSH_PORT_NAME)
            .and_then(|port| port.node_port)
            .ok_or_else(|| anyhow!("service {} exposes no ssh port", service.name))?;
        let host = {
            let attempt = self.attempt.lock();
            let route_host = attempt.resources.route.as_ref().map(|route| route.host.clone());
            let cluster_ip = attempt
                .resources
                .service
                .as_ref()
                .and_then(|service| service.cluster_ip.clone());
            route_host.or(cluster_ip)
        }
        .ok_or_else(|| anyhow!("environment {} has no reachable host", request.names.pod))?;

        let command = format!("ssh worker@{host} -p {port}");
        info!(pod = %request.names.pod, command = %command, "Debug access enabled");
        self.debug.set_ssh_command(command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::environment::{EnvironmentDriver, ProvisioningEnvironmentDriver, RecreationPolicy};
    use crate::errors::ProvisioningReason;
    use crate::testing::{InMemoryComputeBackend, StaticLivenessProbe, StubRepositorySession};
    use std::time::Duration;
    use tokio::sync::oneshot;

    type Outcome = Result<Option<RunningEnvironment>, BuildflowError>;

    fn fast_config() -> EnvironmentConfig {
        EnvironmentConfig::default()
            .with_readiness(Duration::from_millis(5), Duration::from_millis(500))
            .with_creation_retries(1)
    }

    fn driver(
        backend: &Arc<InMemoryComputeBackend>,
        probe: &Arc<StaticLivenessProbe>,
        config: EnvironmentConfig,
    ) -> ProvisioningEnvironmentDriver {
        ProvisioningEnvironmentDriver::with_monitor(
            backend.clone(),
            probe.clone(),
            config,
            PollingMonitor::new(MonitorConfig::default().with_sweep_period_ms(10)),
        )
    }

    fn request(debug: Arc<DebugData>) -> EnvironmentRequest {
        EnvironmentRequest {
            image_id: None,
            repository_session: Arc::new(StubRepositorySession::new("build-7")),
            debug,
            access_token: "secret-token".to_string(),
            temporary_build: false,
            parameters: HashMap::new(),
        }
    }

    fn initialize(environment: &dyn StartedEnvironment) -> oneshot::Receiver<Outcome> {
        let (sender, receiver) = oneshot::channel();
        let sender = Arc::new(Mutex::new(Some(sender)));
        let on_error = sender.clone();
        environment.monitor_initialization(
            Box::new(move |ready| {
                if let Some(sender) = sender.lock().take() {
                    let _ = sender.send(Ok(ready));
                }
            }),
            Box::new(move |error| {
                if let Some(sender) = on_error.lock().take() {
                    let _ = sender.send(Err(error));
                }
            }),
        );
        receiver
    }

    async fn outcome(receiver: oneshot::Receiver<Outcome>) -> Outcome {
        tokio::time::timeout(Duration::from_secs(5), receiver)
            .await
            .expect("initialization did not finish")
            .expect("callback dropped")
    }

    #[test]
    fn test_builder_pod_memory() {
        let mut parameters = HashMap::new();
        assert_eq!(builder_pod_memory(4.0, &parameters).unwrap(), "4096Mi");

        parameters.insert(BUILDER_POD_MEMORY.to_string(), "2.5".to_string());
        assert_eq!(builder_pod_memory(4.0, &parameters).unwrap(), "2560Mi");

        parameters.insert(BUILDER_POD_MEMORY.to_string(), "0.0001".to_string());
        assert_eq!(builder_pod_memory(4.0, &parameters).unwrap(), "1Mi");

        parameters.insert(BUILDER_POD_MEMORY.to_string(), "lots".to_string());
        assert!(matches!(
            builder_pod_memory(4.0, &parameters),
            Err(BuildflowError::Validation(_))
        ));

        parameters.insert(BUILDER_POD_MEMORY.to_string(), "-1".to_string());
        assert!(matches!(
            builder_pod_memory(4.0, &parameters),
            Err(BuildflowError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_ready_environment_uses_internal_url_without_route() {
        let backend = Arc::new(InMemoryComputeBackend::new());
        let probe = Arc::new(StaticLivenessProbe::new(true));
        let started = driver(&backend, &probe, fast_config())
            .start_environment(request(Arc::new(DebugData::new(false))))
            .unwrap();

        let environment = outcome(initialize(started.as_ref())).await.unwrap().unwrap();

        assert_eq!(environment.id, started.id());
        assert!(environment.internal_url.starts_with("http://10."));
        assert!(environment.internal_url.ends_with("/build-agent"));
        assert_eq!(environment.build_agent_url, environment.internal_url);
        assert_eq!(backend.routes_created(), 0);
        assert_eq!(backend.pods_created(), 1);
    }

    #[tokio::test]
    async fn test_public_route_becomes_agent_url() {
        let backend = Arc::new(InMemoryComputeBackend::new());
        let probe = Arc::new(StaticLivenessProbe::new(true));
        let started = driver(&backend, &probe, fast_config().with_public_url(true))
            .start_environment(request(Arc::new(DebugData::new(false))))
            .unwrap();

        let environment = outcome(initialize(started.as_ref())).await.unwrap().unwrap();

        assert_eq!(backend.routes_created(), 1);
        assert!(environment.build_agent_url.contains(".apps.example.com/"));
        assert_ne!(environment.build_agent_url, environment.internal_url);
    }

    #[tokio::test]
    async fn test_retryable_phase_recreates_after_teardown() {
        let backend = Arc::new(InMemoryComputeBackend::new());
        backend.script_pod_phases(&["Pending", "CrashLoopBackOff"]);
        let probe = Arc::new(StaticLivenessProbe::new(true));
        let started = driver(&backend, &probe, fast_config())
            .start_environment(request(Arc::new(DebugData::new(false))))
            .unwrap();

        let environment = outcome(initialize(started.as_ref())).await.unwrap().unwrap();

        assert_eq!(backend.pods_created(), 2);
        let events = backend.events();
        let deleted_first = events
            .iter()
            .position(|e| e.starts_with("delete pod"))
            .unwrap();
        let created_second = events
            .iter()
            .rposition(|e| e.starts_with("create pod"))
            .unwrap();
        assert!(deleted_first < created_second, "events: {events:?}");
        assert_eq!(environment.id, started.id());
    }

    #[tokio::test]
    async fn test_no_retries_left_reports_attempts() {
        let backend = Arc::new(InMemoryComputeBackend::new());
        backend.script_pod_phases(&["CrashLoopBackOff"]);
        let probe = Arc::new(StaticLivenessProbe::new(true));
        let started = driver(&backend, &probe, fast_config().with_creation_retries(0))
            .start_environment(request(Arc::new(DebugData::new(false))))
            .unwrap();

        match outcome(initialize(started.as_ref())).await {
            Err(BuildflowError::Provisioning(error)) => {
                assert_eq!(error.reason, ProvisioningReason::PodFailed);
                assert_eq!(error.attempts, 1);
                assert!(error.message.contains("after 1 attempts"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(backend.pods_created(), 1);
    }

    #[tokio::test]
    async fn test_every_attempt_failing_exhausts_retries() {
        let backend = Arc::new(InMemoryComputeBackend::new());
        backend.script_every_pod_phases(&["CrashLoopBackOff"]);
        let probe = Arc::new(StaticLivenessProbe::new(true));
        let started = driver(&backend, &probe, fast_config().with_creation_retries(2))
            .start_environment(request(Arc::new(DebugData::new(false))))
            .unwrap();

        match outcome(initialize(started.as_ref())).await {
            Err(BuildflowError::Provisioning(error)) => {
                assert_eq!(error.reason, ProvisioningReason::PodFailed);
                assert_eq!(error.attempts, 3);
                assert!(error.message.contains("after 3 attempts"), "{}", error.message);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(backend.requests().len(), 3);
        assert_eq!(backend.pods_created(), 3);

        let events = backend.events();
        let created: Vec<(usize, &str)> = events
            .iter()
            .enumerate()
            .filter_map(|(at, e)| e.strip_prefix("create pod ").map(|name| (at, name)))
            .collect();
        let deleted: Vec<(usize, &str)> = events
            .iter()
            .enumerate()
            .filter_map(|(at, e)| e.strip_prefix("delete pod ").map(|name| (at, name)))
            .collect();
        assert_eq!(created.len(), 3, "events: {events:?}");
        assert_eq!(deleted.len(), 2, "events: {events:?}");
        for (previous, (deleted_at, deleted_name)) in deleted.iter().enumerate() {
            let (_, created_name) = created[previous];
            let (recreated_at, _) = created[previous + 1];
            assert_eq!(*deleted_name, created_name);
            assert!(*deleted_at < recreated_at, "events: {events:?}");
        }
        // The last attempt stays up until the environment is destroyed.
        assert!(backend.live_resources() > 0);
    }

    #[tokio::test]
    async fn test_fatal_phase_is_not_retried() {
        let backend = Arc::new(InMemoryComputeBackend::new());
        backend.script_pod_phases(&["InvalidImageName"]);
        let probe = Arc::new(StaticLivenessProbe::new(true));
        let started = driver(&backend, &probe, fast_config().with_creation_retries(3))
            .start_environment(request(Arc::new(DebugData::new(false))))
            .unwrap();

        match outcome(initialize(started.as_ref())).await {
            Err(BuildflowError::Provisioning(error)) => {
                assert_eq!(error.reason, ProvisioningReason::ImagePull);
                assert!(!error.is_retryable());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(backend.pods_created(), 1);
    }

    #[tokio::test]
    async fn test_creation_failure_is_retried() {
        let backend = Arc::new(InMemoryComputeBackend::new());
        backend.fail_next_pod_creations(1);
        let probe = Arc::new(StaticLivenessProbe::new(true));
        let started = driver(&backend, &probe, fast_config())
            .start_environment(request(Arc::new(DebugData::new(false))))
            .unwrap();

        assert!(outcome(initialize(started.as_ref())).await.unwrap().is_some());
        assert_eq!(backend.pods_created(), 1);
    }

    #[tokio::test]
    async fn test_readiness_timeout_reports_capacity() {
        let backend = Arc::new(InMemoryComputeBackend::new());
        let probe = Arc::new(StaticLivenessProbe::new(false));
        let config = fast_config()
            .with_readiness(Duration::from_millis(5), Duration::from_millis(60))
            .with_creation_retries(0);
        let started = driver(&backend, &probe, config)
            .start_environment(request(Arc::new(DebugData::new(false))))
            .unwrap();

        match outcome(initialize(started.as_ref())).await {
            Err(BuildflowError::Provisioning(error)) => {
                assert_eq!(error.reason, ProvisioningReason::CapacityExhausted);
                assert!(error.is_retryable());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_completes_empty_and_tears_down() {
        let backend = Arc::new(InMemoryComputeBackend::new());
        backend.script_pod_phases(&["Pending"]);
        let probe = Arc::new(StaticLivenessProbe::new(true));
        let config = fast_config().with_readiness(Duration::from_millis(5), Duration::from_secs(10));
        let started = driver(&backend, &probe, config)
            .start_environment(request(Arc::new(DebugData::new(false))))
            .unwrap();

        let receiver = initialize(started.as_ref());
        tokio::time::sleep(Duration::from_millis(30)).await;
        started.cancel();
        started.cancel();

        assert!(outcome(receiver).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.live_resources(), 0);
        assert_eq!(backend.pods_created(), 1);
    }

    #[tokio::test]
    async fn test_monitor_after_cancel_completes_immediately() {
        let backend = Arc::new(InMemoryComputeBackend::new());
        let probe = Arc::new(StaticLivenessProbe::new(true));
        let started = driver(&backend, &probe, fast_config())
            .start_environment(request(Arc::new(DebugData::new(false))))
            .unwrap();

        started.cancel();
        assert!(outcome(initialize(started.as_ref())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_destroy_honours_debug_and_keep_instance() {
        let backend = Arc::new(InMemoryComputeBackend::new());
        let probe = Arc::new(StaticLivenessProbe::new(true));
        let debug = Arc::new(DebugData::new(true));
        let started = driver(&backend, &probe, fast_config())
            .start_environment(request(debug.clone()))
            .unwrap();
        let environment = outcome(initialize(started.as_ref())).await.unwrap().unwrap();

        debug.set_debug_enabled(true);
        environment.destroy_environment().await.unwrap();
        assert_eq!(backend.live_resources(), 2);

        debug.set_debug_enabled(false);
        environment.destroy_environment().await.unwrap();
        assert_eq!(backend.live_resources(), 0);
        // A second destroy finds nothing left to delete.
        environment.destroy_environment().await.unwrap();

        let kept = Arc::new(InMemoryComputeBackend::new());
        let started = driver(&kept, &probe, fast_config().with_keep_instance(true))
            .start_environment(request(Arc::new(DebugData::new(false))))
            .unwrap();
        let environment = outcome(initialize(started.as_ref())).await.unwrap().unwrap();
        environment.destroy_environment().await.unwrap();
        assert_eq!(kept.live_resources(), 2);
    }

    #[tokio::test]
    async fn test_enable_ssh_records_command() {
        let backend = Arc::new(InMemoryComputeBackend::new());
        let probe = Arc::new(StaticLivenessProbe::new(true));
        let debug = Arc::new(DebugData::new(true));
        let started = driver(&backend, &probe, fast_config())
            .start_environment(request(debug.clone()))
            .unwrap();
        let environment = outcome(initialize(started.as_ref())).await.unwrap().unwrap();

        environment.enable_ssh().await.unwrap();

        let command = debug.ssh_command().unwrap();
        assert!(command.starts_with("ssh worker@10."));
        assert!(command.ends_with(&format!("-p {}", InMemoryComputeBackend::SSH_NODE_PORT)));
        assert!(debug.ssh_password().is_some());
    }

    #[tokio::test]
    async fn test_request_variables_carry_session_and_memory() {
        let backend = Arc::new(InMemoryComputeBackend::new());
        let probe = Arc::new(StaticLivenessProbe::new(true));
        let mut req = request(Arc::new(DebugData::new(false)));
        req.parameters
            .insert(BUILDER_POD_MEMORY.to_string(), "1".to_string());
        let started = driver(&backend, &probe, fast_config())
            .start_environment(req)
            .unwrap();
        outcome(initialize(started.as_ref())).await.unwrap();

        let created = backend.requests();
        let first = created.first().unwrap();
        assert_eq!(first.memory, "1024Mi");
        assert_eq!(first.variables["buildContentId"], "build-7");
        assert_eq!(first.variables["accessToken"], "secret-token");
        assert!(!first.variables.contains_key("workerUserPassword"));
        assert!(!first.to_log_string().contains("secret-token"));
    }

    #[test]
    fn test_recreation_policy_default_is_one_retry() {
        assert_eq!(RecreationPolicy::default().max_retries, 1);
    }
}
