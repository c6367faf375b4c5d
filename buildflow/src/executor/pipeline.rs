//! The staged execution pipeline.
//!
//! Stage sequencing is a pure function of the completed stage and the
//! session's cancellation flag ([`advance`]); the async driver in
//! [`Pipeline::run`] only performs each stage's side effects. Stages up to
//! and including [`Stage::RunBuild`] are skipped once cancellation is
//! requested. Later stages always run, and [`Stage::Finalize`] runs after
//! any failure.

use super::session::BuildExecutionSession;
use crate::core::{BuildExecutionStatus, TaskId};
use crate::environment::{
    DebugData, DestroyableEnvironment, EnvironmentDriver, EnvironmentRequest, StartedEnvironment,
};
use crate::errors::BuildflowError;
use crate::spi::{BuildDriver, BuildDriverResult, BuildDriverStatus, RepositoryManager, RepositorySession};
use crate::utils::now_utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Path of the read-only text log socket on the build agent.
pub const LIVE_LOG_SOCKET_PATH: &str = "socket/text/ro";

/// One step of the execution pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Acquire a build repository session.
    ConfigureRepository,
    /// Ask the environment driver for an environment.
    SetUpEnvironment,
    /// Wait for the environment to become ready.
    WaitForEnvironment,
    /// Run the remote build and wait for it.
    RunBuild,
    /// Start SSH access when debugging is enabled.
    EnableDebug,
    /// Classify the remote build's outcome.
    CollectDriverResults,
    /// Extract built artifacts.
    CollectRepositoryResults,
    /// Tear down and compute the final status.
    Finalize,
}

impl Stage {
    /// Whether a pending cancellation skips this stage.
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::ConfigureRepository | Self::SetUpEnvironment | Self::WaitForEnvironment | Self::RunBuild
        )
    }

    /// The stage following this one. [`Stage::Finalize`] is its own successor.
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::ConfigureRepository => Self::SetUpEnvironment,
            Self::SetUpEnvironment => Self::WaitForEnvironment,
            Self::WaitForEnvironment => Self::RunBuild,
            Self::RunBuild => Self::EnableDebug,
            Self::EnableDebug => Self::CollectDriverResults,
            Self::CollectDriverResults => Self::CollectRepositoryResults,
            Self::CollectRepositoryResults | Self::Finalize => Self::Finalize,
        }
    }
}

/// The first stage to run.
#[must_use]
pub const fn first_stage(cancelled: bool) -> Stage {
    if cancelled {
        Stage::Finalize
    } else {
        Stage::ConfigureRepository
    }
}

/// The stage to run after `completed` finished without error.
#[must_use]
pub const fn advance(completed: Stage, cancelled: bool) -> Stage {
    let next = completed.next();
    if cancelled && next.is_cancellable() {
        Stage::Finalize
    } else {
        next
    }
}

/// Final session status. Cancellation wins over failure.
#[must_use]
pub const fn final_status(cancelled: bool, failed: bool) -> BuildExecutionStatus {
    if cancelled {
        BuildExecutionStatus::Cancelled
    } else if failed {
        BuildExecutionStatus::DoneWithErrors
    } else {
        BuildExecutionStatus::Done
    }
}

/// Websocket URL of the live log for a build agent URL.
#[must_use]
pub fn live_logs_uri(build_agent_url: &str) -> String {
    let (scheme, rest) = if let Some(rest) = build_agent_url.strip_prefix("https:") {
        ("wss:", rest)
    } else if let Some(rest) = build_agent_url.strip_prefix("http:") {
        ("ws:", rest)
    } else {
        ("ws:", build_agent_url)
    };
    let separator = if rest.ends_with('/') { "" } else { "/" };
    format!("{scheme}{rest}{separator}{LIVE_LOG_SOCKET_PATH}")
}

/// A stage failure, carrying whatever environment the stage knew about so
/// finalization can tear it down.
#[derive(Error)]
#[error("{error}")]
pub struct BuildProcessError {
    /// The cause.
    pub error: BuildflowError,
    /// Environment to destroy during finalization.
    pub environment: Option<Arc<dyn DestroyableEnvironment>>,
}

impl BuildProcessError {
    /// A failure with no environment attached.
    #[must_use]
    pub const fn new(error: BuildflowError) -> Self {
        Self {
            error,
            environment: None,
        }
    }

    /// A failure that leaves an environment behind.
    #[must_use]
    pub fn with_environment(
        error: BuildflowError,
        environment: Arc<dyn DestroyableEnvironment>,
    ) -> Self {
        Self {
            error,
            environment: Some(environment),
        }
    }
}

impl std::fmt::Debug for BuildProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildProcessError")
            .field("error", &self.error)
            .field("has_environment", &self.environment.is_some())
            .finish()
    }
}

/// Delivers the first of several competing callback outcomes.
struct Reply<T>(Arc<Mutex<Option<oneshot::Sender<T>>>>);

impl<T> Clone for Reply<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Reply<T> {
    fn channel() -> (Self, oneshot::Receiver<T>) {
        let (sender, receiver) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(sender)))), receiver)
    }

    fn send(&self, value: T) {
        if let Some(sender) = self.0.lock().take() {
            // Nobody waits once the pipeline has moved on.
            let _ = sender.send(value);
        }
    }
}

/// Collaborators every pipeline calls into.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub(crate) repository_manager: Arc<dyn RepositoryManager>,
    pub(crate) environment_driver: Arc<dyn EnvironmentDriver>,
    pub(crate) build_driver: Arc<dyn BuildDriver>,
}

/// One run of the pipeline for one session.
pub(crate) struct Pipeline {
    session: Arc<BuildExecutionSession>,
    collaborators: Collaborators,
    sessions: Arc<DashMap<TaskId, Arc<BuildExecutionSession>>>,
    debug: Arc<DebugData>,
    repository_session: Option<Arc<dyn RepositorySession>>,
    started: Option<Arc<dyn StartedEnvironment>>,
    completed_build: Option<BuildDriverResult>,
}

impl Pipeline {
    pub(crate) fn new(
        session: Arc<BuildExecutionSession>,
        collaborators: Collaborators,
        sessions: Arc<DashMap<TaskId, Arc<BuildExecutionSession>>>,
    ) -> Self {
        let debug = Arc::new(DebugData::new(session.configuration().keep_pod_on_failure));
        Self {
            session,
            collaborators,
            sessions,
            debug,
            repository_session: None,
            started: None,
            completed_build: None,
        }
    }

    /// Runs every stage, then finalizes.
    pub(crate) async fn run(mut self) {
        let mut stage = first_stage(self.session.is_cancelled());
        let mut failure = None;
        while stage != Stage::Finalize {
            debug!(execution_id = self.session.id(), stage = ?stage, "Entering stage");
            match self.run_stage(stage).await {
                Ok(()) => stage = advance(stage, self.session.is_cancelled()),
                Err(error) => {
                    warn!(
                        execution_id = self.session.id(),
                        stage = ?stage,
                        kind = error.error.kind(),
                        error = %error.error,
                        "Stage failed"
                    );
                    failure = Some(error);
                    stage = Stage::Finalize;
                }
            }
        }
        self.finalize(failure).await;
    }

    /// Finalizes a pipeline that never ran a stage.
    pub(crate) async fn abort(self, error: BuildflowError) {
        self.finalize(Some(BuildProcessError::new(error))).await;
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<(), BuildProcessError> {
        match stage {
            Stage::ConfigureRepository => self.configure_repository().await,
            Stage::SetUpEnvironment => self.set_up_environment(),
            Stage::WaitForEnvironment => self.wait_for_environment().await,
            Stage::RunBuild => self.run_build().await,
            Stage::EnableDebug => {
                self.enable_debug().await;
                Ok(())
            }
            Stage::CollectDriverResults => {
                self.collect_driver_results();
                Ok(())
            }
            Stage::CollectRepositoryResults => self.collect_repository_results().await,
            Stage::Finalize => Ok(()),
        }
    }

    async fn configure_repository(&mut self) -> Result<(), BuildProcessError> {
        self.session.set_status(BuildExecutionStatus::RepoSettingUp);
        let repository_session = self
            .collaborators
            .repository_manager
            .create_build_repository(self.session.configuration(), self.session.access_token())
            .await
            .map_err(|e| {
                BuildProcessError::new(BuildflowError::system(format!(
                    "cannot configure build repository: {e:#}"
                )))
            })?;
        debug!(
            execution_id = self.session.id(),
            repository = repository_session.build_repository_id(),
            "Build repository configured"
        );
        self.repository_session = Some(repository_session);
        Ok(())
    }

    fn set_up_environment(&mut self) -> Result<(), BuildProcessError> {
        self.session.set_status(BuildExecutionStatus::BuildEnvSettingUp);
        let repository_session = self.repository_session.clone().ok_or_else(|| {
            BuildProcessError::new(BuildflowError::system("no build repository session"))
        })?;
        let configuration = self.session.configuration();
        let request = EnvironmentRequest {
            image_id: configuration.image_id.clone(),
            repository_session,
            debug: self.debug.clone(),
            access_token: self.session.access_token().to_string(),
            temporary_build: configuration.temporary_build,
            parameters: configuration.parameters.clone(),
        };
        let started = self
            .collaborators
            .environment_driver
            .start_environment(request)
            .map_err(BuildProcessError::new)?;

        let cancelling = started.clone();
        self.session.token().set_cancel_hook(move || cancelling.cancel());
        self.started = Some(started);
        Ok(())
    }

    async fn wait_for_environment(&mut self) -> Result<(), BuildProcessError> {
        let started = self.started.clone().ok_or_else(|| {
            BuildProcessError::new(BuildflowError::system("no environment was started"))
        })?;
        let (reply, receiver) = Reply::channel();
        let on_error = reply.clone();

        self.session.set_status(BuildExecutionStatus::BuildEnvWaiting);
        started.monitor_initialization(
            Box::new(move |environment| reply.send(Ok(environment))),
            Box::new(move |error| on_error.send(Err(error))),
        );

        match receiver.await {
            Ok(Ok(Some(environment))) => {
                info!(
                    execution_id = self.session.id(),
                    environment = %environment.id,
                    "Build environment ready"
                );
                self.session.set_running_environment(environment);
                self.session
                    .set_status(BuildExecutionStatus::BuildEnvSetupCompleteSuccess);
                Ok(())
            }
            Ok(Ok(None)) if self.session.is_cancelled() => {
                debug!(execution_id = self.session.id(), "Environment initialization cancelled");
                Ok(())
            }
            Ok(Ok(None)) => Err(BuildProcessError::with_environment(
                BuildflowError::system("environment initialization ended without an environment"),
                started.destroyable(),
            )),
            Ok(Err(error)) => {
                self.session
                    .set_status(BuildExecutionStatus::BuildEnvSetupCompleteWithError);
                Err(BuildProcessError::with_environment(error, started.destroyable()))
            }
            Err(_) => Err(BuildProcessError::with_environment(
                BuildflowError::system("environment driver dropped its callbacks"),
                started.destroyable(),
            )),
        }
    }

    async fn run_build(&mut self) -> Result<(), BuildProcessError> {
        self.session.set_status(BuildExecutionStatus::BuildSettingUp);
        let environment = self.session.running_environment().ok_or_else(|| {
            BuildProcessError::new(BuildflowError::system("no running environment"))
        })?;

        let live_logs = live_logs_uri(&environment.build_agent_url);
        debug!(execution_id = self.session.id(), url = %live_logs, "Live log socket");
        self.session.set_live_logs_uri(live_logs);

        let (reply, receiver) = Reply::channel();
        let on_error = reply.clone();
        let running = self
            .collaborators
            .build_driver
            .start_project_build(
                self.session.configuration(),
                &environment,
                Box::new(move |result| reply.send(Ok(result))),
                Box::new(move |error| on_error.send(Err(error))),
            )
            .await
            .map_err(|e| {
                BuildProcessError::with_environment(
                    BuildflowError::remote_build(format!("cannot start build: {e:#}")),
                    environment.destroyable(),
                )
            })?;

        let cancelling = running.clone();
        self.session.token().set_cancel_hook(move || cancelling.cancel());
        self.session.set_status(BuildExecutionStatus::BuildWaiting);

        let outcome = receiver.await;
        // Past this point cancellation no longer aborts the pipeline.
        self.session.token().clear_cancel_hook();
        match outcome {
            Ok(Ok(result)) => {
                self.completed_build = Some(result);
                Ok(())
            }
            Ok(Err(e)) => Err(BuildProcessError::with_environment(
                BuildflowError::remote_build(format!("{e:#}")),
                environment.destroyable(),
            )),
            Err(_) => Err(BuildProcessError::with_environment(
                BuildflowError::remote_build("build driver dropped its callbacks"),
                environment.destroyable(),
            )),
        }
    }

    async fn enable_debug(&self) {
        let Some(environment) = self.session.running_environment() else {
            return;
        };
        let build_failed = self.completed_build.as_ref().is_some_and(|result| {
            matches!(
                result.status,
                BuildDriverStatus::Failed | BuildDriverStatus::SystemError
            )
        });
        if build_failed && environment.debug.is_enable_debug_on_failure() {
            environment.debug.set_debug_enabled(true);
        }
        if !environment.debug.is_debug_enabled() {
            return;
        }
        match environment.enable_ssh().await {
            Ok(()) => {
                let command = environment.debug.ssh_command().unwrap_or_default();
                info!(
                    execution_id = self.session.id(),
                    command = %command,
                    "Environment kept for debugging"
                );
            }
            Err(e) => warn!(
                execution_id = self.session.id(),
                error = %format!("{e:#}"),
                "Cannot enable debug access"
            ),
        }
    }

    fn collect_driver_results(&self) {
        let Some(result) = self.completed_build.clone() else {
            debug!(execution_id = self.session.id(), "No remote build result to collect");
            return;
        };
        let status = match result.status {
            BuildDriverStatus::Success => BuildExecutionStatus::BuildCompletedSuccess,
            BuildDriverStatus::Cancelled => BuildExecutionStatus::Cancelled,
            BuildDriverStatus::Failed | BuildDriverStatus::SystemError => {
                BuildExecutionStatus::BuildCompletedWithError
            }
        };
        self.session.set_status(status);
        if result.status == BuildDriverStatus::Cancelled {
            self.session.token().cancel("remote build was cancelled");
        }
        self.session
            .set_status(BuildExecutionStatus::CollectingResultsFromBuildDriver);
        self.session.set_build_driver_result(result);
    }

    async fn collect_repository_results(&self) -> Result<(), BuildProcessError> {
        if self.session.has_failed() || self.session.is_cancelled() {
            return Ok(());
        }
        let Some(environment) = self.session.running_environment() else {
            return Ok(());
        };
        self.session
            .set_status(BuildExecutionStatus::CollectingResultsFromRepositoryManager);
        let result = environment
            .repository_session
            .extract_build_artifacts()
            .await
            .map_err(|e| {
                BuildProcessError::with_environment(
                    BuildflowError::result_collection(format!("{e:#}")),
                    environment.destroyable(),
                )
            })?;
        let failed = result.completion_status.is_failed();
        self.session.set_repository_result(result);
        if failed {
            self.session.set_status(
                BuildExecutionStatus::CollectingResultsFromRepositoryManagerCompletedWithError,
            );
        } else {
            self.session.set_status(
                BuildExecutionStatus::CollectingResultsFromRepositoryManagerCompletedSuccess,
            );
        }
        Ok(())
    }

    async fn finalize(self, failure: Option<BuildProcessError>) {
        let session = &self.session;
        session.set_status(BuildExecutionStatus::FinalizingExecution);
        if session.start_time().is_none() {
            session.set_exception(BuildflowError::system("missing start time"));
        }

        let (error, failed_environment) = match failure {
            Some(failure) => (Some(failure.error), failure.environment),
            None => (None, None),
        };
        if let Some(error) = error {
            session.set_exception(error);
        }

        let environment = failed_environment
            .or_else(|| session.running_environment().map(|environment| environment.destroyable()));
        if let Some(environment) = environment {
            session.set_status(BuildExecutionStatus::BuildEnvDestroying);
            match environment.destroy_environment().await {
                Ok(()) => session.set_status(BuildExecutionStatus::BuildEnvDestroyed),
                Err(e) => {
                    warn!(execution_id = session.id(), error = %format!("{e:#}"), "Cannot destroy build environment");
                    session.set_exception(BuildflowError::system(format!(
                        "cannot destroy build environment: {e:#}"
                    )));
                }
            }
        } else {
            debug!(execution_id = session.id(), "No environment to destroy");
        }

        if let Err(e) = session.set_end_time(now_utc()) {
            session.set_exception(e);
        }

        debug!(execution_id = session.id(), "Closing build repository");
        if let Err(e) = self
            .collaborators
            .repository_manager
            .close(session.access_token())
            .await
        {
            session.set_exception(BuildflowError::system(format!(
                "cannot close build repository: {e:#}"
            )));
        }

        let status = final_status(session.is_cancelled(), session.has_failed());
        info!(execution_id = session.id(), status = %status, "Build execution finished");
        self.sessions.remove(&session.id());
        session.set_status(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stages_run_in_order() {
        let mut stage = first_stage(false);
        let mut seen = vec![stage];
        while stage != Stage::Finalize {
            stage = advance(stage, false);
            seen.push(stage);
        }
        assert_eq!(
            seen,
            vec![
                Stage::ConfigureRepository,
                Stage::SetUpEnvironment,
                Stage::WaitForEnvironment,
                Stage::RunBuild,
                Stage::EnableDebug,
                Stage::CollectDriverResults,
                Stage::CollectRepositoryResults,
                Stage::Finalize,
            ]
        );
    }

    #[test]
    fn test_cancellation_skips_to_finalize_before_build_finished() {
        assert_eq!(first_stage(true), Stage::Finalize);
        assert_eq!(advance(Stage::ConfigureRepository, true), Stage::Finalize);
        assert_eq!(advance(Stage::SetUpEnvironment, true), Stage::Finalize);
        assert_eq!(advance(Stage::WaitForEnvironment, true), Stage::Finalize);
    }

    #[test]
    fn test_cancellation_ignored_after_build_finished() {
        assert_eq!(advance(Stage::RunBuild, true), Stage::EnableDebug);
        assert_eq!(advance(Stage::EnableDebug, true), Stage::CollectDriverResults);
        assert_eq!(
            advance(Stage::CollectDriverResults, true),
            Stage::CollectRepositoryResults
        );
        assert_eq!(advance(Stage::Finalize, true), Stage::Finalize);
    }

    #[test]
    fn test_final_status_precedence() {
        assert_eq!(final_status(true, true), BuildExecutionStatus::Cancelled);
        assert_eq!(final_status(false, true), BuildExecutionStatus::DoneWithErrors);
        assert_eq!(final_status(false, false), BuildExecutionStatus::Done);
    }

    #[test]
    fn test_live_logs_uri() {
        assert_eq!(
            live_logs_uri("http://10.0.0.1/ctx/build-agent"),
            "ws://10.0.0.1/ctx/build-agent/socket/text/ro"
        );
        assert_eq!(
            live_logs_uri("https://agent.example.com/ctx/"),
            "wss://agent.example.com/ctx/socket/text/ro"
        );
    }
}
