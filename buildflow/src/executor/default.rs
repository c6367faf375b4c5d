//! The default executor: a bounded pool of pipelines keyed by execution id.

use super::pipeline::{Collaborators, Pipeline};
use super::session::{BuildExecutionSession, ExecutionStatusCallback};
use crate::config::ExecutorConfig;
use crate::core::{BuildExecutionConfiguration, BuildExecutionStatus, TaskId};
use crate::environment::EnvironmentDriver;
use crate::errors::{AlreadyRunningError, BuildflowError, BuildflowResult};
use crate::observability::execution_span;
use crate::spi::{BuildDriver, RepositoryManager};
use crate::utils::now_utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn, Instrument};

/// Runs build executions.
pub trait BuildExecutor: Send + Sync {
    /// Starts the pipeline for `configuration` and returns its session.
    ///
    /// Fails with [`BuildflowError::AlreadyRunning`] if a session exists for
    /// the execution id, and with [`BuildflowError::System`] when the
    /// executor cannot take more work.
    fn start_building(
        &self,
        configuration: BuildExecutionConfiguration,
        on_status: ExecutionStatusCallback,
        access_token: &str,
    ) -> BuildflowResult<Arc<BuildExecutionSession>>;

    /// Requests cancellation. Returns false, with a warning, if no session exists.
    fn cancel(&self, execution_id: TaskId) -> bool;

    /// The live session for an execution id.
    fn running_execution(&self, execution_id: TaskId) -> Option<Arc<BuildExecutionSession>>;

    /// Stops accepting work.
    fn shutdown(&self);
}

/// Executes pipelines on the Tokio runtime, at most `thread_pool_size` at once.
pub struct DefaultBuildExecutor {
    collaborators: Collaborators,
    sessions: Arc<DashMap<TaskId, Arc<BuildExecutionSession>>>,
    workers: Arc<Semaphore>,
    pool_size: usize,
}

impl DefaultBuildExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        config: &ExecutorConfig,
        repository_manager: Arc<dyn RepositoryManager>,
        environment_driver: Arc<dyn EnvironmentDriver>,
        build_driver: Arc<dyn BuildDriver>,
    ) -> Self {
        let pool_size = config.thread_pool_size.max(1);
        Self {
            collaborators: Collaborators {
                repository_manager,
                environment_driver,
                build_driver,
            },
            sessions: Arc::new(DashMap::new()),
            workers: Arc::new(Semaphore::new(pool_size)),
            pool_size,
        }
    }

    /// Number of live sessions, queued ones included.
    #[must_use]
    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    /// Number of idle workers.
    #[must_use]
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Configured pool size.
    #[must_use]
    pub const fn pool_size(&self) -> usize {
        self.pool_size
    }
}

impl BuildExecutor for DefaultBuildExecutor {
    fn start_building(
        &self,
        configuration: BuildExecutionConfiguration,
        on_status: ExecutionStatusCallback,
        access_token: &str,
    ) -> BuildflowResult<Arc<BuildExecutionSession>> {
        let id = configuration.id;
        if self.workers.is_closed() {
            return Err(BuildflowError::system(format!(
                "executor is shut down, cannot run execution {id}"
            )));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BuildflowError::system(format!("no async runtime available: {e}")))?;

        let span = execution_span(id, configuration.id_rev);
        let session = Arc::new(BuildExecutionSession::new(
            configuration,
            access_token,
            on_status,
        ));
        match self.sessions.entry(id) {
            Entry::Occupied(_) => {
                return Err(AlreadyRunningError { execution_id: id }.into());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session.clone());
            }
        }

        session.set_start_time(now_utc());
        session.set_status(BuildExecutionStatus::New);

        let pipeline = Pipeline::new(session.clone(), self.collaborators.clone(), self.sessions.clone());
        let workers = self.workers.clone();
        runtime.spawn(
            async move {
                match workers.acquire_owned().await {
                    Ok(_permit) => pipeline.run().await,
                    Err(_) => {
                        pipeline
                            .abort(BuildflowError::system("executor shut down before the build started"))
                            .await;
                    }
                }
            }
            .instrument(span),
        );
        info!(execution_id = id, "Build execution started");
        Ok(session)
    }

    fn cancel(&self, execution_id: TaskId) -> bool {
        let session = self.sessions.get(&execution_id).map(|entry| entry.value().clone());
        match session {
            Some(session) => {
                session.cancel();
                true
            }
            None => {
                warn!(execution_id, "Trying to cancel a session that does not exist");
                false
            }
        }
    }

    fn running_execution(&self, execution_id: TaskId) -> Option<Arc<BuildExecutionSession>> {
        self.sessions.get(&execution_id).map(|entry| entry.value().clone())
    }

    fn shutdown(&self) {
        if !self.workers.is_closed() {
            info!(active = self.active(), "Shutting down build executor");
            self.workers.close();
        }
    }
}

impl std::fmt::Debug for DefaultBuildExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultBuildExecutor")
            .field("pool_size", &self.pool_size)
            .field("active", &self.active())
            .field("available_workers", &self.available_workers())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BuildConfigurationAudited, BuildOptions, User};
    use crate::events::BuildExecutionStatusChangedEvent;
    use crate::spi::{BuildDriverStatus, MockRepositoryManager, RepositoryManagerResult};
    use crate::testing::{
        BuildBehavior, EnvironmentBehavior, ScriptedBuildDriver, ScriptedEnvironmentDriver,
        StubRepositoryManager, StubRepositorySession,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_test::assert_err;

    use BuildExecutionStatus as S;

    struct Harness {
        executor: DefaultBuildExecutor,
        repository: Arc<StubRepositoryManager>,
        environments: Arc<ScriptedEnvironmentDriver>,
        builds: Arc<ScriptedBuildDriver>,
    }

    impl Harness {
        fn new(environment: EnvironmentBehavior, build: BuildBehavior) -> Self {
            Self::with_repository(StubRepositoryManager::new(), environment, build)
        }

        fn with_repository(
            repository: StubRepositoryManager,
            environment: EnvironmentBehavior,
            build: BuildBehavior,
        ) -> Self {
            let repository = Arc::new(repository);
            let environments = Arc::new(ScriptedEnvironmentDriver::new(environment));
            let builds = Arc::new(ScriptedBuildDriver::new(build));
            let executor = DefaultBuildExecutor::new(
                &ExecutorConfig::default(),
                repository.clone(),
                environments.clone(),
                builds.clone(),
            );
            Self {
                executor,
                repository,
                environments,
                builds,
            }
        }
    }

    fn configuration(id: TaskId, options: BuildOptions) -> BuildExecutionConfiguration {
        BuildExecutionConfiguration::for_task(
            id,
            &BuildConfigurationAudited::new(100 + id, 1, format!("component-{id}")),
            &User::new(1, "builder"),
            options,
        )
    }

    fn ignore_status() -> ExecutionStatusCallback {
        Arc::new(|_: &BuildExecutionSession, _: &BuildExecutionStatusChangedEvent| {})
    }

    /// Starts an execution and returns a channel of its status changes.
    fn start(
        executor: &dyn BuildExecutor,
        id: TaskId,
        options: BuildOptions,
    ) -> (Arc<BuildExecutionSession>, mpsc::UnboundedReceiver<BuildExecutionStatus>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let session = executor
            .start_building(
                configuration(id, options),
                Arc::new(
                    move |_: &BuildExecutionSession, event: &BuildExecutionStatusChangedEvent| {
                        let _ = sender.send(event.new_status);
                    },
                ),
                "token-1",
            )
            .unwrap();
        (session, receiver)
    }

    async fn statuses_until_end(
        receiver: &mut mpsc::UnboundedReceiver<BuildExecutionStatus>,
    ) -> Vec<BuildExecutionStatus> {
        let mut seen = Vec::new();
        let mut finalizing = false;
        loop {
            let status = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
                .await
                .expect("execution did not finish")
                .expect("status channel closed");
            seen.push(status);
            finalizing |= status == S::FinalizingExecution;
            if finalizing && matches!(status, S::Done | S::DoneWithErrors | S::Cancelled) {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_successful_execution_emits_full_sequence() {
        let harness = Harness::new(
            EnvironmentBehavior::Ready,
            BuildBehavior::Complete(BuildDriverStatus::Success),
        );
        let (session, mut receiver) = start(&harness.executor, 1, BuildOptions::default());

        let seen = statuses_until_end(&mut receiver).await;

        assert_eq!(
            seen,
            vec![
                S::New,
                S::RepoSettingUp,
                S::BuildEnvSettingUp,
                S::BuildEnvWaiting,
                S::BuildEnvSetupCompleteSuccess,
                S::BuildSettingUp,
                S::BuildWaiting,
                S::BuildCompletedSuccess,
                S::CollectingResultsFromBuildDriver,
                S::CollectingResultsFromRepositoryManager,
                S::CollectingResultsFromRepositoryManagerCompletedSuccess,
                S::FinalizingExecution,
                S::BuildEnvDestroying,
                S::BuildEnvDestroyed,
                S::Done,
            ]
        );
        assert!(session.end_time().is_some());
        assert!(session.exception().is_none());
        assert_eq!(
            session.live_logs_uri().as_deref(),
            Some("ws://agent.local/build-agent/socket/text/ro")
        );
        assert_eq!(harness.environments.destroyed(), 1);
        assert_eq!(harness.repository.closed_tokens(), vec!["token-1".to_string()]);
        assert!(harness.executor.running_execution(1).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_start_is_already_running() {
        let harness = Harness::new(EnvironmentBehavior::Hang, BuildBehavior::Hang);
        let (_session, _receiver) = start(&harness.executor, 4, BuildOptions::default());

        let again = harness.executor.start_building(
            configuration(4, BuildOptions::default()),
            ignore_status(),
            "token-2",
        );
        match assert_err!(again) {
            BuildflowError::AlreadyRunning(e) => assert_eq!(e.execution_id, 4),
            other => panic!("unexpected error: {other:?}"),
        }
        harness.executor.cancel(4);
    }

    #[tokio::test]
    async fn test_failed_build_is_done_with_errors_and_skips_artifacts() {
        let harness = Harness::new(
            EnvironmentBehavior::Ready,
            BuildBehavior::Complete(BuildDriverStatus::Failed),
        );
        let (session, mut receiver) = start(&harness.executor, 2, BuildOptions::default());

        let seen = statuses_until_end(&mut receiver).await;

        assert!(seen.contains(&S::BuildCompletedWithError));
        assert!(!seen.contains(&S::CollectingResultsFromRepositoryManager));
        assert_eq!(seen.last(), Some(&S::DoneWithErrors));
        assert_eq!(
            session.build_driver_result().map(|r| r.status),
            Some(BuildDriverStatus::Failed)
        );
        assert_eq!(harness.environments.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_environment_failure_destroys_environment_from_error() {
        let harness = Harness::new(
            EnvironmentBehavior::Fail(BuildflowError::system("no capacity")),
            BuildBehavior::Complete(BuildDriverStatus::Success),
        );
        let (session, mut receiver) = start(&harness.executor, 3, BuildOptions::default());

        let seen = statuses_until_end(&mut receiver).await;

        assert!(seen.contains(&S::BuildEnvSetupCompleteWithError));
        assert_eq!(seen.last(), Some(&S::DoneWithErrors));
        assert_eq!(harness.builds.invocations(), 0);
        assert_eq!(harness.environments.destroyed(), 1);
        assert!(session.running_environment().is_none());
        assert!(matches!(session.exception(), Some(BuildflowError::System(_))));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_environment() {
        let harness = Harness::new(
            EnvironmentBehavior::Hang,
            BuildBehavior::Complete(BuildDriverStatus::Success),
        );
        let (session, mut receiver) = start(&harness.executor, 5, BuildOptions::default());
        loop {
            if receiver.recv().await == Some(S::BuildEnvWaiting) {
                break;
            }
        }

        assert!(harness.executor.cancel(5));
        let seen = statuses_until_end(&mut receiver).await;

        assert_eq!(seen.last(), Some(&S::Cancelled));
        assert_eq!(harness.builds.invocations(), 0);
        assert_eq!(harness.environments.cancelled(), 1);
        assert!(session.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_during_remote_build_cancels_it() {
        let harness = Harness::new(EnvironmentBehavior::Ready, BuildBehavior::Hang);
        let (_session, mut receiver) = start(&harness.executor, 6, BuildOptions::default());
        loop {
            if receiver.recv().await == Some(S::BuildWaiting) {
                break;
            }
        }

        harness.executor.cancel(6);
        let seen = statuses_until_end(&mut receiver).await;

        assert_eq!(harness.builds.cancellations(), 1);
        assert!(seen.contains(&S::BuildEnvDestroyed));
        assert_eq!(seen.last(), Some(&S::Cancelled));
        assert_eq!(harness.environments.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_cancel_after_build_finished_still_tears_down() {
        let harness = Harness::new(
            EnvironmentBehavior::Ready,
            BuildBehavior::Complete(BuildDriverStatus::Success),
        );
        let (sender, mut receiver) = mpsc::unbounded_channel();
        harness
            .executor
            .start_building(
                configuration(7, BuildOptions::default()),
                Arc::new(move |session: &BuildExecutionSession, event: &BuildExecutionStatusChangedEvent| {
                    if event.new_status == S::BuildCompletedSuccess {
                        session.cancel();
                    }
                    let _ = sender.send(event.new_status);
                }),
                "token-1",
            )
            .unwrap();

        let seen = statuses_until_end(&mut receiver).await;

        assert_eq!(harness.builds.invocations(), 1);
        assert_eq!(harness.builds.cancellations(), 0);
        assert!(seen.contains(&S::BuildEnvDestroyed));
        assert!(!seen.contains(&S::CollectingResultsFromRepositoryManager));
        assert_eq!(seen.last(), Some(&S::Cancelled));
    }

    #[tokio::test]
    async fn test_repository_failure_skips_environment() {
        let harness = Harness::with_repository(
            StubRepositoryManager::new().with_create_error("repository offline"),
            EnvironmentBehavior::Ready,
            BuildBehavior::Complete(BuildDriverStatus::Success),
        );
        let (session, mut receiver) = start(&harness.executor, 8, BuildOptions::default());

        let seen = statuses_until_end(&mut receiver).await;

        assert_eq!(harness.environments.started(), 0);
        assert!(!seen.contains(&S::BuildEnvDestroying));
        assert_eq!(seen.last(), Some(&S::DoneWithErrors));
        let message = session.exception().unwrap().to_string();
        assert!(message.contains("repository offline"), "{message}");
    }

    #[tokio::test]
    async fn test_artifact_extraction_error_is_result_collection() {
        let harness = Harness::with_repository(
            StubRepositoryManager::new().with_extraction_error("storage full"),
            EnvironmentBehavior::Ready,
            BuildBehavior::Complete(BuildDriverStatus::Success),
        );
        let (session, mut receiver) = start(&harness.executor, 9, BuildOptions::default());

        let seen = statuses_until_end(&mut receiver).await;

        assert_eq!(seen.last(), Some(&S::DoneWithErrors));
        assert!(matches!(
            session.exception(),
            Some(BuildflowError::ResultCollection(_))
        ));
        assert_eq!(harness.environments.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_keep_pod_on_failure_enables_ssh() {
        let harness = Harness::new(
            EnvironmentBehavior::Ready,
            BuildBehavior::Complete(BuildDriverStatus::Failed),
        );
        let (session, mut receiver) = start(
            &harness.executor,
            10,
            BuildOptions::default().with_keep_pod_on_failure(true),
        );

        statuses_until_end(&mut receiver).await;

        assert_eq!(harness.environments.ssh_enabled(), 1);
        let environment = session.running_environment().unwrap();
        assert!(environment.debug.is_debug_enabled());
        assert!(environment.debug.ssh_command().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let harness = Harness::new(
            EnvironmentBehavior::Ready,
            BuildBehavior::Complete(BuildDriverStatus::Success),
        );
        harness.executor.shutdown();

        let refused = harness.executor.start_building(
            configuration(11, BuildOptions::default()),
            ignore_status(),
            "token",
        );
        assert!(matches!(refused, Err(BuildflowError::System(_))));
    }

    #[tokio::test]
    async fn test_cancel_unknown_execution_is_noop() {
        let harness = Harness::new(EnvironmentBehavior::Ready, BuildBehavior::Hang);
        assert!(!harness.executor.cancel(404));
    }

    #[tokio::test]
    async fn test_pool_limits_concurrent_pipelines() {
        let repository = Arc::new(StubRepositoryManager::new());
        let executor = DefaultBuildExecutor::new(
            &ExecutorConfig::default().with_thread_pool_size(1),
            repository.clone(),
            Arc::new(ScriptedEnvironmentDriver::new(EnvironmentBehavior::Ready)),
            Arc::new(ScriptedBuildDriver::new(BuildBehavior::Hang)),
        );
        let (_first, mut first_statuses) = start(&executor, 20, BuildOptions::default());
        let (_second, mut second_statuses) = start(&executor, 21, BuildOptions::default());
        loop {
            if first_statuses.recv().await == Some(S::BuildWaiting) {
                break;
            }
        }

        assert_eq!(second_statuses.recv().await, Some(S::New));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(second_statuses.try_recv().is_err());
        assert_eq!(repository.created(), 1);

        executor.cancel(20);
        assert_eq!(second_statuses.recv().await, Some(S::RepoSettingUp));
        loop {
            if second_statuses.recv().await == Some(S::BuildWaiting) {
                break;
            }
        }
        assert_eq!(repository.created(), 2);
        executor.cancel(21);
        let seen = statuses_until_end(&mut second_statuses).await;
        assert_eq!(seen.last(), Some(&S::Cancelled));
    }

    #[tokio::test]
    async fn test_repository_manager_contract_with_mock() {
        let mut repository = MockRepositoryManager::new();
        repository
            .expect_create_build_repository()
            .times(1)
            .returning(|_, _| {
                Ok(Arc::new(
                    StubRepositorySession::new("mocked")
                        .with_result(RepositoryManagerResult::success(vec!["lib.jar".into()])),
                ))
            });
        repository.expect_close().times(1).returning(|_| Ok(()));

        let executor = DefaultBuildExecutor::new(
            &ExecutorConfig::default(),
            Arc::new(repository),
            Arc::new(ScriptedEnvironmentDriver::new(EnvironmentBehavior::Ready)),
            Arc::new(ScriptedBuildDriver::new(BuildBehavior::Complete(
                BuildDriverStatus::Success,
            ))),
        );
        let (session, mut receiver) = start(&executor, 30, BuildOptions::default());

        let seen = statuses_until_end(&mut receiver).await;
        assert_eq!(seen.last(), Some(&S::Done));
        assert_eq!(
            session.repository_result().unwrap().built_artifacts,
            vec!["lib.jar".to_string()]
        );
    }

    #[test]
    fn test_session_callback_sees_session_state() {
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        let session = BuildExecutionSession::new(
            configuration(40, BuildOptions::default()),
            "t",
            Arc::new(move |session: &BuildExecutionSession, _: &BuildExecutionStatusChangedEvent| {
                *sink.lock() = Some(session.id());
            }),
        );
        session.set_status(S::RepoSettingUp);
        assert_eq!(*observed.lock(), Some(40));
    }
}
