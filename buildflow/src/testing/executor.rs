//! An executor that records starts and finishes executions on demand.

use crate::core::{BuildExecutionConfiguration, BuildExecutionStatus, TaskId};
use crate::errors::{AlreadyRunningError, BuildflowError, BuildflowResult};
use crate::executor::{BuildExecutionSession, BuildExecutor, ExecutionStatusCallback};
use crate::utils::now_utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Sessions = Arc<DashMap<TaskId, Arc<BuildExecutionSession>>>;

/// A [`BuildExecutor`] that runs no pipeline.
///
/// Started executions stay live until the test finishes them with
/// [`finish`](Self::finish). With auto-completion enabled every execution
/// finishes on its own shortly after starting, failing for configurations
/// registered with [`fail_configuration`](Self::fail_configuration) and
/// ending cancelled once cancel was requested.
#[derive(Default)]
pub struct RecordingExecutor {
    sessions: Sessions,
    started: Mutex<Vec<TaskId>>,
    cancelled: Mutex<Vec<TaskId>>,
    failing_configurations: Mutex<HashSet<u32>>,
    refuse_starts: AtomicBool,
    auto_complete: AtomicBool,
}

impl RecordingExecutor {
    /// Creates an executor that waits for [`finish`](Self::finish).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an executor that finishes every execution by itself.
    #[must_use]
    pub fn auto_completing() -> Self {
        let executor = Self::default();
        executor.auto_complete.store(true, Ordering::SeqCst);
        executor
    }

    /// Makes auto-completed executions of a configuration fail.
    pub fn fail_configuration(&self, configuration_id: u32) {
        self.failing_configurations.lock().insert(configuration_id);
    }

    /// Makes later starts fail with a system error.
    pub fn refuse_starts(&self, refuse: bool) {
        self.refuse_starts.store(refuse, Ordering::SeqCst);
    }

    /// Execution ids in start order.
    #[must_use]
    pub fn started(&self) -> Vec<TaskId> {
        self.started.lock().clone()
    }

    /// Execution ids cancel was requested for.
    #[must_use]
    pub fn cancelled(&self) -> Vec<TaskId> {
        self.cancelled.lock().clone()
    }

    /// Finishes a live execution with a final status. Returns false if no
    /// execution is live under the id.
    pub fn finish(
        &self,
        execution_id: TaskId,
        status: BuildExecutionStatus,
        exception: Option<BuildflowError>,
    ) -> bool {
        finish(&self.sessions, execution_id, status, exception)
    }

    /// Finishes a live execution successfully.
    pub fn succeed(&self, execution_id: TaskId) -> bool {
        self.finish(execution_id, BuildExecutionStatus::Done, None)
    }

    /// Finishes a live execution with a failed remote build.
    pub fn fail(&self, execution_id: TaskId, message: &str) -> bool {
        self.finish(
            execution_id,
            BuildExecutionStatus::DoneWithErrors,
            Some(BuildflowError::remote_build(message)),
        )
    }

    fn schedule(&self, execution_id: TaskId, status: BuildExecutionStatus, exception: Option<BuildflowError>) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let cancelled = sessions
                .get(&execution_id)
                .is_some_and(|entry| entry.is_cancelled());
            if cancelled {
                finish(&sessions, execution_id, BuildExecutionStatus::Cancelled, None);
            } else {
                finish(&sessions, execution_id, status, exception);
            }
        });
    }
}

fn finish(
    sessions: &DashMap<TaskId, Arc<BuildExecutionSession>>,
    execution_id: TaskId,
    status: BuildExecutionStatus,
    exception: Option<BuildflowError>,
) -> bool {
    let Some((_, session)) = sessions.remove(&execution_id) else {
        return false;
    };
    if let Some(exception) = exception {
        session.set_exception(exception);
    }
    session.set_status(BuildExecutionStatus::FinalizingExecution);
    if let Err(e) = session.set_end_time(now_utc()) {
        session.set_exception(e);
    }
    session.set_status(status);
    true
}

impl BuildExecutor for RecordingExecutor {
    fn start_building(
        &self,
        configuration: BuildExecutionConfiguration,
        on_status: ExecutionStatusCallback,
        access_token: &str,
    ) -> BuildflowResult<Arc<BuildExecutionSession>> {
        if self.refuse_starts.load(Ordering::SeqCst) {
            return Err(BuildflowError::system("no executor capacity"));
        }
        let id = configuration.id;
        if self.sessions.contains_key(&id) {
            return Err(AlreadyRunningError { execution_id: id }.into());
        }
        let failing = self
            .failing_configurations
            .lock()
            .contains(&configuration.id_rev.id);
        let session = Arc::new(BuildExecutionSession::new(configuration, access_token, on_status));
        self.sessions.insert(id, session.clone());
        self.started.lock().push(id);
        session.set_start_time(now_utc());
        session.set_status(BuildExecutionStatus::New);

        if self.auto_complete.load(Ordering::SeqCst) {
            if failing {
                self.schedule(
                    id,
                    BuildExecutionStatus::DoneWithErrors,
                    Some(BuildflowError::remote_build("scripted failure")),
                );
            } else {
                self.schedule(id, BuildExecutionStatus::Done, None);
            }
        }
        Ok(session)
    }

    fn cancel(&self, execution_id: TaskId) -> bool {
        self.cancelled.lock().push(execution_id);
        let session = self.sessions.get(&execution_id).map(|entry| entry.value().clone());
        let Some(session) = session else {
            return false;
        };
        session.cancel();
        if self.auto_complete.load(Ordering::SeqCst) {
            self.schedule(execution_id, BuildExecutionStatus::Cancelled, None);
        }
        true
    }

    fn running_execution(&self, execution_id: TaskId) -> Option<Arc<BuildExecutionSession>> {
        self.sessions.get(&execution_id).map(|entry| entry.value().clone())
    }

    fn shutdown(&self) {
        self.refuse_starts(true);
    }
}

impl std::fmt::Debug for RecordingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingExecutor")
            .field("live", &self.sessions.len())
            .field("started", &self.started.lock().len())
            .finish_non_exhaustive()
    }
}
