//! Scripted collaborators for executor and environment tests.

use crate::core::BuildExecutionConfiguration;
use crate::environment::{
    DebugData, DestroyableEnvironment, EnvironmentDriver, EnvironmentFailed, EnvironmentHandle,
    EnvironmentReady, EnvironmentRequest, RunningEnvironment, StartedEnvironment,
};
use crate::errors::{BuildflowError, BuildflowResult};
use crate::spi::{
    BuildCompletion, BuildDriver, BuildDriverResult, BuildDriverStatus, BuildFailure,
    RepositoryConnectionInfo, RepositoryManager, RepositoryManagerResult, RepositorySession,
    RunningBuild,
};
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A repository session with a fixed extraction outcome.
#[derive(Debug)]
pub struct StubRepositorySession {
    id: String,
    connection_info: RepositoryConnectionInfo,
    extraction: Result<RepositoryManagerResult, String>,
    extractions: AtomicUsize,
}

impl StubRepositorySession {
    /// Creates a session whose extraction succeeds with no artifacts.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            connection_info: RepositoryConnectionInfo {
                dependency_url: format!("http://repository.local/{id}/dependencies"),
                deploy_url: format!("http://repository.local/{id}/deploy"),
            },
            id,
            extraction: Ok(RepositoryManagerResult::success(Vec::new())),
            extractions: AtomicUsize::new(0),
        }
    }

    /// Sets the extraction result.
    #[must_use]
    pub fn with_result(mut self, result: RepositoryManagerResult) -> Self {
        self.extraction = Ok(result);
        self
    }

    /// Makes extraction fail.
    #[must_use]
    pub fn with_extraction_error(mut self, message: impl Into<String>) -> Self {
        self.extraction = Err(message.into());
        self
    }

    /// Number of extraction calls.
    #[must_use]
    pub fn extractions(&self) -> usize {
        self.extractions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepositorySession for StubRepositorySession {
    fn build_repository_id(&self) -> &str {
        &self.id
    }

    fn connection_info(&self) -> &RepositoryConnectionInfo {
        &self.connection_info
    }

    async fn extract_build_artifacts(&self) -> anyhow::Result<RepositoryManagerResult> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        self.extraction.clone().map_err(|message| anyhow!(message))
    }
}

/// A repository manager handing out [`StubRepositorySession`]s.
#[derive(Debug)]
pub struct StubRepositoryManager {
    create_error: Option<String>,
    extraction: Result<RepositoryManagerResult, String>,
    created: AtomicUsize,
    closed: Mutex<Vec<String>>,
}

impl Default for StubRepositoryManager {
    fn default() -> Self {
        Self {
            create_error: None,
            extraction: Ok(RepositoryManagerResult::success(Vec::new())),
            created: AtomicUsize::new(0),
            closed: Mutex::new(Vec::new()),
        }
    }
}

impl StubRepositoryManager {
    /// Creates a manager whose sessions succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes repository creation fail.
    #[must_use]
    pub fn with_create_error(mut self, message: impl Into<String>) -> Self {
        self.create_error = Some(message.into());
        self
    }

    /// Sets the extraction result of every session.
    #[must_use]
    pub fn with_extraction_result(mut self, result: RepositoryManagerResult) -> Self {
        self.extraction = Ok(result);
        self
    }

    /// Makes extraction fail in every session.
    #[must_use]
    pub fn with_extraction_error(mut self, message: impl Into<String>) -> Self {
        self.extraction = Err(message.into());
        self
    }

    /// Number of repositories created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Credentials passed to `close`, in call order.
    #[must_use]
    pub fn closed_tokens(&self) -> Vec<String> {
        self.closed.lock().clone()
    }
}

#[async_trait]
impl RepositoryManager for StubRepositoryManager {
    async fn create_build_repository(
        &self,
        execution: &BuildExecutionConfiguration,
        _access_token: &str,
    ) -> anyhow::Result<Arc<dyn RepositorySession>> {
        if let Some(message) = &self.create_error {
            return Err(anyhow!(message.clone()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let session = StubRepositorySession::new(format!("build-{}", execution.id));
        let session = match &self.extraction {
            Ok(result) => session.with_result(result.clone()),
            Err(message) => session.with_extraction_error(message.clone()),
        };
        Ok(Arc::new(session))
    }

    async fn close(&self, access_token: &str) -> anyhow::Result<()> {
        self.closed.lock().push(access_token.to_string());
        Ok(())
    }
}

/// How a [`ScriptedEnvironmentDriver`] environment behaves.
#[derive(Debug, Clone)]
pub enum EnvironmentBehavior {
    /// Becomes ready immediately.
    Ready,
    /// Reports the error while initializing.
    Fail(BuildflowError),
    /// Never becomes ready. Cancelling completes it without an environment.
    Hang,
    /// `start_environment` itself fails.
    StartError(BuildflowError),
}

#[derive(Debug, Default)]
struct EnvironmentCounters {
    started: AtomicUsize,
    destroyed: AtomicUsize,
    cancelled: AtomicUsize,
    ssh: AtomicUsize,
}

/// An environment driver with scripted outcomes and call counters.
#[derive(Debug)]
pub struct ScriptedEnvironmentDriver {
    behavior: EnvironmentBehavior,
    counters: Arc<EnvironmentCounters>,
}

impl ScriptedEnvironmentDriver {
    /// Agent URL of every environment this driver readies.
    pub const AGENT_URL: &'static str = "http://agent.local/build-agent";

    /// Creates a driver.
    #[must_use]
    pub fn new(behavior: EnvironmentBehavior) -> Self {
        Self {
            behavior,
            counters: Arc::default(),
        }
    }

    /// Environments started.
    #[must_use]
    pub fn started(&self) -> usize {
        self.counters.started.load(Ordering::SeqCst)
    }

    /// Destroy calls, through a running environment or a failed one.
    #[must_use]
    pub fn destroyed(&self) -> usize {
        self.counters.destroyed.load(Ordering::SeqCst)
    }

    /// Cancel calls on started environments.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.counters.cancelled.load(Ordering::SeqCst)
    }

    /// SSH enable calls.
    #[must_use]
    pub fn ssh_enabled(&self) -> usize {
        self.counters.ssh.load(Ordering::SeqCst)
    }
}

impl EnvironmentDriver for ScriptedEnvironmentDriver {
    fn start_environment(
        &self,
        request: EnvironmentRequest,
    ) -> BuildflowResult<Arc<dyn StartedEnvironment>> {
        if let EnvironmentBehavior::StartError(error) = &self.behavior {
            return Err(error.clone());
        }
        let number = self.counters.started.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(ScriptedEnvironment {
            id: format!("scripted-env-{number}"),
            behavior: self.behavior.clone(),
            handle: Arc::new(ScriptedHandle {
                counters: self.counters.clone(),
                debug: request.debug.clone(),
            }),
            request,
            counters: self.counters.clone(),
            pending: Mutex::new(PendingReady::default()),
        }))
    }
}

#[derive(Default)]
struct PendingReady {
    cancelled: bool,
    on_complete: Option<EnvironmentReady>,
}

struct ScriptedEnvironment {
    id: String,
    behavior: EnvironmentBehavior,
    request: EnvironmentRequest,
    handle: Arc<ScriptedHandle>,
    counters: Arc<EnvironmentCounters>,
    pending: Mutex<PendingReady>,
}

impl ScriptedEnvironment {
    fn running(&self) -> RunningEnvironment {
        RunningEnvironment::new(
            self.id.clone(),
            8080,
            ScriptedEnvironmentDriver::AGENT_URL,
            "http://10.0.0.1/build-agent",
            self.request.repository_session.clone(),
            "/tmp/build",
            self.request.debug.clone(),
            self.handle.clone(),
        )
    }
}

impl StartedEnvironment for ScriptedEnvironment {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn monitor_initialization(&self, on_complete: EnvironmentReady, on_error: EnvironmentFailed) {
        if self.pending.lock().cancelled {
            on_complete(None);
            return;
        }
        match &self.behavior {
            EnvironmentBehavior::Ready => on_complete(Some(self.running())),
            EnvironmentBehavior::Fail(error) => on_error(error.clone()),
            EnvironmentBehavior::Hang | EnvironmentBehavior::StartError(_) => {
                let mut pending = self.pending.lock();
                if pending.cancelled {
                    drop(pending);
                    on_complete(None);
                } else {
                    pending.on_complete = Some(on_complete);
                }
            }
        }
    }

    fn cancel(&self) {
        self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
        let on_complete = {
            let mut pending = self.pending.lock();
            pending.cancelled = true;
            pending.on_complete.take()
        };
        if let Some(on_complete) = on_complete {
            on_complete(None);
        }
    }

    fn destroyable(&self) -> Arc<dyn DestroyableEnvironment> {
        self.handle.clone()
    }
}

struct ScriptedHandle {
    counters: Arc<EnvironmentCounters>,
    debug: Arc<DebugData>,
}

#[async_trait]
impl DestroyableEnvironment for ScriptedHandle {
    async fn destroy_environment(&self) -> anyhow::Result<()> {
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl EnvironmentHandle for ScriptedHandle {
    async fn enable_ssh(&self) -> anyhow::Result<()> {
        self.counters.ssh.fetch_add(1, Ordering::SeqCst);
        self.debug.generate_ssh_password();
        self.debug.set_ssh_command("ssh worker@agent.local -p 2222");
        Ok(())
    }
}

/// How a [`ScriptedBuildDriver`] build behaves.
#[derive(Debug, Clone)]
pub enum BuildBehavior {
    /// Completes with the status.
    Complete(BuildDriverStatus),
    /// Runs until cancelled, then completes as cancelled.
    Hang,
    /// `start_project_build` itself fails.
    StartError(String),
    /// Reports a driver error.
    Error(String),
}

/// A build driver with scripted outcomes and call counters.
#[derive(Debug)]
pub struct ScriptedBuildDriver {
    behavior: BuildBehavior,
    delay: Option<Duration>,
    invocations: AtomicUsize,
    cancellations: Arc<AtomicUsize>,
}

impl ScriptedBuildDriver {
    /// Creates a driver that reports its outcome immediately.
    #[must_use]
    pub fn new(behavior: BuildBehavior) -> Self {
        Self {
            behavior,
            delay: None,
            invocations: AtomicUsize::new(0),
            cancellations: Arc::default(),
        }
    }

    /// Reports the outcome after `delay`, from a spawned task.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Builds started.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Cancel calls on running builds.
    #[must_use]
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    fn report<T: Send + 'static>(&self, value: T, callback: Box<dyn FnOnce(T) + Send>) {
        match self.delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    callback(value);
                });
            }
            None => callback(value),
        }
    }
}

#[async_trait]
impl BuildDriver for ScriptedBuildDriver {
    async fn start_project_build(
        &self,
        _execution: &BuildExecutionConfiguration,
        _environment: &RunningEnvironment,
        on_complete: BuildCompletion,
        on_error: BuildFailure,
    ) -> anyhow::Result<Arc<dyn RunningBuild>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let build = ScriptedBuild {
            cancellations: self.cancellations.clone(),
            pending: Mutex::new(None),
        };
        match &self.behavior {
            BuildBehavior::StartError(message) => return Err(anyhow!(message.clone())),
            BuildBehavior::Complete(status) => {
                self.report(BuildDriverResult::new(*status), on_complete);
            }
            BuildBehavior::Error(message) => self.report(anyhow!(message.clone()), on_error),
            BuildBehavior::Hang => *build.pending.lock() = Some(on_complete),
        }
        Ok(Arc::new(build))
    }
}

struct ScriptedBuild {
    cancellations: Arc<AtomicUsize>,
    pending: Mutex<Option<BuildCompletion>>,
}

impl RunningBuild for ScriptedBuild {
    fn cancel(&self) {
        self.cancellations.fetch_add(1, Ordering::SeqCst);
        let pending = self.pending.lock().take();
        if let Some(on_complete) = pending {
            on_complete(BuildDriverResult::new(BuildDriverStatus::Cancelled));
        }
    }
}
