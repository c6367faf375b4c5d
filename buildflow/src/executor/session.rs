//! Execution session: the runtime record of one pipeline run.

use crate::cancellation::CancellationToken;
use crate::core::{BuildExecutionConfiguration, BuildExecutionStatus, TaskId};
use crate::environment::RunningEnvironment;
use crate::errors::{BuildflowError, BuildflowResult};
use crate::events::BuildExecutionStatusChangedEvent;
use crate::spi::{BuildDriverResult, RepositoryManagerResult};
use crate::utils::{now_utc, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Receives every status change of a session.
///
/// Invoked synchronously on the pipeline's task with no session lock held.
pub type ExecutionStatusCallback =
    Arc<dyn Fn(&BuildExecutionSession, &BuildExecutionStatusChangedEvent) + Send + Sync>;

/// Runtime state of one build execution.
pub struct BuildExecutionSession {
    configuration: BuildExecutionConfiguration,
    access_token: String,
    status: Mutex<BuildExecutionStatus>,
    start_time: RwLock<Option<Timestamp>>,
    end_time: RwLock<Option<Timestamp>>,
    token: CancellationToken,
    running_environment: RwLock<Option<RunningEnvironment>>,
    build_driver_result: RwLock<Option<BuildDriverResult>>,
    repository_result: RwLock<Option<RepositoryManagerResult>>,
    exception: RwLock<Option<BuildflowError>>,
    failed: AtomicBool,
    live_logs_uri: RwLock<Option<String>>,
    on_status: ExecutionStatusCallback,
}

impl BuildExecutionSession {
    /// Creates a session in status NEW.
    #[must_use]
    pub fn new(
        configuration: BuildExecutionConfiguration,
        access_token: impl Into<String>,
        on_status: ExecutionStatusCallback,
    ) -> Self {
        Self {
            configuration,
            access_token: access_token.into(),
            status: Mutex::new(BuildExecutionStatus::New),
            start_time: RwLock::new(None),
            end_time: RwLock::new(None),
            token: CancellationToken::new(),
            running_environment: RwLock::new(None),
            build_driver_result: RwLock::new(None),
            repository_result: RwLock::new(None),
            exception: RwLock::new(None),
            failed: AtomicBool::new(false),
            live_logs_uri: RwLock::new(None),
            on_status,
        }
    }

    /// Execution id.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.configuration.id
    }

    /// What is being built.
    #[must_use]
    pub const fn configuration(&self) -> &BuildExecutionConfiguration {
        &self.configuration
    }

    /// Credential used towards collaborators.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> BuildExecutionStatus {
        *self.status.lock()
    }

    /// Moves to `status` and notifies the callback. A failing status marks
    /// the session failed.
    pub fn set_status(&self, status: BuildExecutionStatus) {
        if status.has_failed() {
            self.failed.store(true, Ordering::SeqCst);
        }
        let old_status = std::mem::replace(&mut *self.status.lock(), status);
        debug!(
            execution_id = self.id(),
            old_status = %old_status,
            new_status = %status,
            "Execution status changed"
        );
        let event = BuildExecutionStatusChangedEvent {
            execution_id: self.id(),
            id_rev: self.configuration.id_rev,
            user_id: self.configuration.user_id,
            old_status,
            new_status: status,
            at: now_utc(),
        };
        (self.on_status)(self, &event);
    }

    /// When the pipeline started.
    #[must_use]
    pub fn start_time(&self) -> Option<Timestamp> {
        *self.start_time.read()
    }

    /// Records the start time.
    pub fn set_start_time(&self, at: Timestamp) {
        *self.start_time.write() = Some(at);
    }

    /// When the pipeline finished.
    #[must_use]
    pub fn end_time(&self) -> Option<Timestamp> {
        *self.end_time.read()
    }

    /// Records the end time. Fails if it was already recorded.
    pub fn set_end_time(&self, at: Timestamp) -> BuildflowResult<()> {
        let mut end_time = self.end_time.write();
        if end_time.is_some() {
            return Err(BuildflowError::system(format!(
                "end time of execution {} already set",
                self.id()
            )));
        }
        *end_time = Some(at);
        Ok(())
    }

    /// The session's cancellation token.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Requests cancellation, running the current stage's cancel hook.
    pub fn cancel(&self) -> bool {
        let first = self.token.cancel("cancel requested");
        if first {
            info!(execution_id = self.id(), status = %self.status(), "Cancelling build execution");
        }
        first
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The ready environment, once provisioned.
    #[must_use]
    pub fn running_environment(&self) -> Option<RunningEnvironment> {
        self.running_environment.read().clone()
    }

    /// Records the ready environment.
    pub fn set_running_environment(&self, environment: RunningEnvironment) {
        *self.running_environment.write() = Some(environment);
    }

    /// The remote build's result.
    #[must_use]
    pub fn build_driver_result(&self) -> Option<BuildDriverResult> {
        self.build_driver_result.read().clone()
    }

    /// Records the remote build's result.
    pub fn set_build_driver_result(&self, result: BuildDriverResult) {
        *self.build_driver_result.write() = Some(result);
    }

    /// The artifact extraction result.
    #[must_use]
    pub fn repository_result(&self) -> Option<RepositoryManagerResult> {
        self.repository_result.read().clone()
    }

    /// Records the artifact extraction result.
    pub fn set_repository_result(&self, result: RepositoryManagerResult) {
        *self.repository_result.write() = Some(result);
    }

    /// The first captured failure.
    #[must_use]
    pub fn exception(&self) -> Option<BuildflowError> {
        self.exception.read().clone()
    }

    /// Captures a failure and marks the session failed. The first failure is kept.
    pub fn set_exception(&self, error: BuildflowError) {
        self.failed.store(true, Ordering::SeqCst);
        let mut exception = self.exception.write();
        if exception.is_none() {
            *exception = Some(error);
        } else {
            debug!(execution_id = self.id(), error = %error, "Additional execution failure");
        }
    }

    /// Whether any step failed.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Websocket URL of the live build log.
    #[must_use]
    pub fn live_logs_uri(&self) -> Option<String> {
        self.live_logs_uri.read().clone()
    }

    /// Records the live build log URL.
    pub fn set_live_logs_uri(&self, uri: impl Into<String>) {
        *self.live_logs_uri.write() = Some(uri.into());
    }
}

impl std::fmt::Debug for BuildExecutionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildExecutionSession")
            .field("id", &self.id())
            .field("id_rev", &self.configuration.id_rev)
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .field("failed", &self.has_failed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BuildConfigurationAudited, BuildOptions, User};
    use pretty_assertions::assert_eq;

    fn session_with_log() -> (BuildExecutionSession, Arc<Mutex<Vec<BuildExecutionStatus>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let configuration = BuildExecutionConfiguration::for_task(
            3,
            &BuildConfigurationAudited::new(10, 1, "lib"),
            &User::new(7, "demo"),
            BuildOptions::default(),
        );
        let session = BuildExecutionSession::new(
            configuration,
            "token",
            Arc::new(move |_: &BuildExecutionSession, event: &BuildExecutionStatusChangedEvent| {
                log.lock().push(event.new_status);
            }),
        );
        (session, seen)
    }

    #[test]
    fn test_status_changes_are_reported() {
        let (session, seen) = session_with_log();
        session.set_status(BuildExecutionStatus::RepoSettingUp);
        session.set_status(BuildExecutionStatus::BuildEnvSettingUp);

        assert_eq!(session.status(), BuildExecutionStatus::BuildEnvSettingUp);
        assert_eq!(
            *seen.lock(),
            vec![
                BuildExecutionStatus::RepoSettingUp,
                BuildExecutionStatus::BuildEnvSettingUp
            ]
        );
        assert!(!session.has_failed());
    }

    #[test]
    fn test_failing_status_marks_failed() {
        let (session, _) = session_with_log();
        session.set_status(BuildExecutionStatus::BuildCompletedWithError);
        assert!(session.has_failed());
    }

    #[test]
    fn test_end_time_set_twice_is_error() {
        let (session, _) = session_with_log();
        assert!(session.set_end_time(now_utc()).is_ok());
        assert!(matches!(
            session.set_end_time(now_utc()),
            Err(BuildflowError::System(_))
        ));
    }

    #[test]
    fn test_first_exception_kept() {
        let (session, _) = session_with_log();
        session.set_exception(BuildflowError::remote_build("first"));
        session.set_exception(BuildflowError::system("second"));
        assert!(session.has_failed());
        assert!(matches!(session.exception(), Some(BuildflowError::RemoteBuild(m)) if m == "first"));
    }

    #[test]
    fn test_cancel_runs_hook_once() {
        let (session, _) = session_with_log();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        session.token().set_cancel_hook(move || *counter.lock() += 1);

        assert!(session.cancel());
        assert!(!session.cancel());
        assert!(session.is_cancelled());
        assert_eq!(*hits.lock(), 1);
    }
}
