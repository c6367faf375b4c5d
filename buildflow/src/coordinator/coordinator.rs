//! The build coordinator.

use super::build_set::BuildSetTask;
use super::graph::TaskGraph;
use super::task::BuildTask;
use crate::config::CoordinatorConfig;
use crate::core::{
    BuildConfigurationAudited, BuildExecutionConfiguration, BuildExecutionStatus, BuildOptions,
    BuildSetId, BuildStatus, BuildTarget, TaskId, User,
};
use crate::errors::{BuildflowError, BuildflowResult, ConflictError};
use crate::events::{BuildExecutionStatusChangedEvent, BuildStatusChangedEvent, NoOpStatusSink, StatusSink};
use crate::executor::{BuildExecutionSession, BuildExecutor, ExecutionStatusCallback};
use crate::spi::{BuildRecord, BuildRecordStore, ConfigurationSource, NoOpBuildRecordStore};
use crate::utils::{elapsed_ms, now_utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builds a [`BuildCoordinator`].
pub struct BuildCoordinatorBuilder {
    config: CoordinatorConfig,
    executor: Arc<dyn BuildExecutor>,
    configurations: Arc<dyn ConfigurationSource>,
    sink: Arc<dyn StatusSink>,
    records: Arc<dyn BuildRecordStore>,
}

impl BuildCoordinatorBuilder {
    /// Sets the coordinator settings.
    #[must_use]
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the sink receiving every status change.
    #[must_use]
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the store receiving terminal build records.
    #[must_use]
    pub fn with_record_store(mut self, records: Arc<dyn BuildRecordStore>) -> Self {
        self.records = records;
        self
    }

    /// Creates the coordinator.
    #[must_use]
    pub fn build(self) -> BuildCoordinator {
        let first_id = self.config.first_task_id.max(1);
        BuildCoordinator {
            inner: Arc::new(Inner {
                executor: self.executor,
                configurations: self.configurations,
                sink: self.sink,
                records: self.records,
                accepting: AtomicBool::new(true),
                state: Mutex::new(State {
                    tasks: HashMap::new(),
                    graph: TaskGraph::new(),
                    sets: HashMap::new(),
                    next_task_id: first_id,
                    next_set_id: first_id,
                }),
            }),
        }
    }
}

/// Schedules build tasks over their dependency graph.
///
/// A task is handed to the executor once every dependency succeeded. A task
/// ending in any failure status (FAILED, SYSTEM_ERROR, REJECTED, CANCELLED)
/// rejects its pending dependants transitively, each exactly once.
///
/// Status sinks are called with the coordinator's state locked and must not
/// call back into the coordinator. The executor is always called without
/// the lock.
#[derive(Clone)]
pub struct BuildCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    executor: Arc<dyn BuildExecutor>,
    configurations: Arc<dyn ConfigurationSource>,
    sink: Arc<dyn StatusSink>,
    records: Arc<dyn BuildRecordStore>,
    accepting: AtomicBool,
    state: Mutex<State>,
}

struct State {
    tasks: HashMap<TaskId, BuildTask>,
    graph: TaskGraph,
    sets: HashMap<BuildSetId, Arc<BuildSetTask>>,
    next_task_id: TaskId,
    next_set_id: BuildSetId,
}

struct Start {
    task_id: TaskId,
    configuration: BuildExecutionConfiguration,
    access_token: String,
}

/// Work collected under the state lock and carried out after releasing it.
#[derive(Default)]
struct Effects {
    starts: Vec<Start>,
    cancels: Vec<TaskId>,
    records: Vec<BuildRecord>,
}

impl Effects {
    fn is_empty(&self) -> bool {
        self.starts.is_empty() && self.cancels.is_empty() && self.records.is_empty()
    }
}

/// Configurations resolved for one submission.
struct Submission {
    name: String,
    configuration_set_id: Option<u32>,
    milestone_record_set_id: Option<u32>,
    configurations: Vec<BuildConfigurationAudited>,
}

impl BuildCoordinator {
    /// Starts building a coordinator with a no-op sink and record store.
    #[must_use]
    pub fn builder(
        executor: Arc<dyn BuildExecutor>,
        configurations: Arc<dyn ConfigurationSource>,
    ) -> BuildCoordinatorBuilder {
        BuildCoordinatorBuilder {
            config: CoordinatorConfig::default(),
            executor,
            configurations,
            sink: Arc::new(NoOpStatusSink),
            records: Arc::new(NoOpBuildRecordStore),
        }
    }

    /// Submits a configuration, with its dependencies when the options ask
    /// for them, or a configuration set.
    ///
    /// One task is created per configuration revision; dependency edges are
    /// wired between members of the submission only. Tasks without
    /// dependencies start immediately.
    ///
    /// Fails with [`BuildflowError::Conflict`] if a live task already builds
    /// one of the revisions, unless `force_rebuild` is set, and with
    /// [`BuildflowError::Validation`] if a configuration cannot be resolved.
    pub fn submit(
        &self,
        target: BuildTarget,
        user: &User,
        options: BuildOptions,
    ) -> BuildflowResult<Arc<BuildSetTask>> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(BuildflowError::system("coordinator is shut down"));
        }
        let submission = self.inner.resolve(&target, options)?;
        let mut effects = Effects::default();
        let set = {
            let mut state = self.inner.state.lock();
            if !options.force_rebuild {
                check_conflicts(&state, &submission.configurations)?;
            }
            let set = state.create_set(&submission, user, options);
            info!(
                build_set_id = set.id(),
                name = %set.name(),
                tasks = set.task_ids().len(),
                user = %user.username,
                "Build set submitted"
            );
            let order = state.graph.topological_order(&set.task_ids());
            for task_id in order {
                let status = if state.graph.dependencies(task_id).is_empty() {
                    BuildStatus::Enqueued
                } else {
                    BuildStatus::WaitingForDependencies
                };
                self.inner
                    .update_status(&mut state, task_id, status, None, &mut effects);
            }
            set
        };
        self.inner.apply(effects);
        Ok(set)
    }

    /// Requests cancellation of a task. Safe at any stage.
    ///
    /// A task that was not started yet is cancelled at once; a running task
    /// is cancelled through the executor and reaches CANCELLED when its
    /// pipeline finishes. Returns false for unknown or terminal tasks.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        let mut effects = Effects::default();
        let accepted = {
            let mut state = self.inner.state.lock();
            let Some(status) = state.tasks.get(&task_id).map(|task| task.status) else {
                warn!(task_id, "Cannot cancel unknown build task");
                return false;
            };
            match status {
                BuildStatus::New | BuildStatus::WaitingForDependencies => {
                    self.inner.update_status(
                        &mut state,
                        task_id,
                        BuildStatus::Cancelled,
                        Some("Cancelled before start".to_string()),
                        &mut effects,
                    );
                    true
                }
                BuildStatus::Enqueued | BuildStatus::Building => {
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.cancel_requested = true;
                        if task.execution_started {
                            effects.cancels.push(task_id);
                        } else {
                            debug!(task_id, "Cancel deferred until the execution starts");
                        }
                    }
                    true
                }
                _ => false,
            }
        };
        self.inner.apply(effects);
        accepted
    }

    /// Snapshot of a live task.
    #[must_use]
    pub fn task(&self, task_id: TaskId) -> Option<BuildTask> {
        self.inner.state.lock().tasks.get(&task_id).cloned()
    }

    /// Snapshots of every live task, by id.
    #[must_use]
    pub fn tasks(&self) -> Vec<BuildTask> {
        let mut tasks: Vec<_> = self.inner.state.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|task| task.id);
        tasks
    }

    /// A live build set.
    #[must_use]
    pub fn build_set(&self, build_set_id: BuildSetId) -> Option<Arc<BuildSetTask>> {
        self.inner.state.lock().sets.get(&build_set_id).cloned()
    }

    /// Ids of the live tasks a task depends on.
    #[must_use]
    pub fn dependencies(&self, task_id: TaskId) -> Vec<TaskId> {
        self.inner.state.lock().graph.dependencies(task_id)
    }

    /// Ids of the live tasks depending on a task.
    #[must_use]
    pub fn dependants(&self, task_id: TaskId) -> Vec<TaskId> {
        self.inner.state.lock().graph.dependants(task_id)
    }

    /// The executor's session for a running task.
    #[must_use]
    pub fn running_execution(&self, task_id: TaskId) -> Option<Arc<BuildExecutionSession>> {
        self.inner.executor.running_execution(task_id)
    }

    /// Stops accepting submissions, cancels every live task and shuts the
    /// executor down.
    pub fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        let live: Vec<TaskId> = {
            let state = self.inner.state.lock();
            let mut ids: Vec<_> = state
                .tasks
                .values()
                .filter(|task| !task.is_completed())
                .map(|task| task.id)
                .collect();
            ids.sort_unstable();
            ids
        };
        info!(live = live.len(), "Shutting down build coordinator");
        for task_id in live {
            self.cancel(task_id);
        }
        self.inner.executor.shutdown();
    }
}

impl std::fmt::Debug for BuildCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BuildCoordinator")
            .field("tasks", &state.tasks.len())
            .field("build_sets", &state.sets.len())
            .field("accepting", &self.inner.accepting.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn check_conflicts(
    state: &State,
    configurations: &[BuildConfigurationAudited],
) -> BuildflowResult<()> {
    for configuration in configurations {
        let running = state
            .tasks
            .values()
            .find(|task| task.id_rev() == configuration.id_rev && !task.is_completed());
        if let Some(task) = running {
            return Err(ConflictError::new(format!(
                "Configuration {} ({}) is already being built",
                configuration.name, configuration.id_rev
            ))
            .with_existing_task(task.id)
            .into());
        }
    }
    Ok(())
}

/// Coarse task status for a session's final execution status.
fn outcome(
    session: &BuildExecutionSession,
    status: BuildExecutionStatus,
) -> (BuildStatus, Option<String>) {
    match status {
        BuildExecutionStatus::Done => (BuildStatus::Success, None),
        BuildExecutionStatus::Cancelled => (BuildStatus::Cancelled, None),
        _ => {
            let exception = session.exception();
            let description = exception.as_ref().map(ToString::to_string).or_else(|| {
                session
                    .build_driver_result()
                    .map(|result| format!("Build driver finished with status {:?}", result.status))
            });
            let status = match exception {
                None
                | Some(BuildflowError::RemoteBuild(_) | BuildflowError::ResultCollection(_)) => {
                    BuildStatus::Failed
                }
                Some(_) => BuildStatus::SystemError,
            };
            (status, description)
        }
    }
}

fn is_final(session: &BuildExecutionSession, status: BuildExecutionStatus) -> bool {
    session.end_time().is_some()
        && matches!(
            status,
            BuildExecutionStatus::Done
                | BuildExecutionStatus::DoneWithErrors
                | BuildExecutionStatus::Cancelled
        )
}

impl State {
    fn create_set(
        &mut self,
        submission: &Submission,
        user: &User,
        options: BuildOptions,
    ) -> Arc<BuildSetTask> {
        let set_id = self.next_set_id;
        self.next_set_id += 1;

        let mut by_configuration = HashMap::with_capacity(submission.configurations.len());
        let mut task_ids = Vec::with_capacity(submission.configurations.len());
        for configuration in &submission.configurations {
            let task_id = self.next_task_id;
            self.next_task_id += 1;
            let record_set_ids: BTreeSet<u32> = submission
                .milestone_record_set_id
                .into_iter()
                .chain(configuration.milestone_record_set_ids.iter().copied())
                .collect();
            let task = BuildTask::new(
                task_id,
                configuration.clone(),
                user.clone(),
                options,
                set_id,
                record_set_ids.into_iter().collect(),
            );
            self.graph.add_task(task_id);
            self.tasks.insert(task_id, task);
            by_configuration.insert(configuration.id_rev.id, task_id);
            task_ids.push(task_id);
        }
        for configuration in &submission.configurations {
            let Some(task_id) = by_configuration.get(&configuration.id_rev.id) else {
                continue;
            };
            for dependency in &configuration.dependency_ids {
                if let Some(dependency_task) = by_configuration.get(dependency) {
                    self.graph.add_dependency(*task_id, *dependency_task);
                }
            }
        }

        let set = Arc::new(BuildSetTask::new(
            set_id,
            submission.name.clone(),
            user.clone(),
            submission.configuration_set_id,
            &task_ids,
        ));
        self.sets.insert(set_id, set.clone());
        set
    }

    /// Whether a waiting task has every dependency succeeded.
    fn is_ready(&self, task_id: TaskId) -> bool {
        self.tasks
            .get(&task_id)
            .is_some_and(|task| task.status == BuildStatus::WaitingForDependencies)
            && self.graph.dependencies(task_id).iter().all(|dependency| {
                self.tasks
                    .get(dependency)
                    .is_some_and(|task| task.status == BuildStatus::Success)
            })
    }

    /// Drops a finished set and its tasks from the live state.
    fn release_set(&mut self, set_id: BuildSetId) {
        let Some(set) = self.sets.remove(&set_id) else {
            return;
        };
        for task_id in set.task_ids() {
            self.tasks.remove(&task_id);
            self.graph.remove_task(task_id);
        }
        debug!(build_set_id = set_id, "Released finished build set");
    }
}

impl Inner {
    fn resolve(&self, target: &BuildTarget, options: BuildOptions) -> BuildflowResult<Submission> {
        match target {
            BuildTarget::Configuration(configuration_id) => {
                let root = self.configurations.latest(*configuration_id).ok_or_else(|| {
                    BuildflowError::validation(format!(
                        "Configuration {configuration_id} does not exist"
                    ))
                })?;
                let name = root.name.clone();
                let mut configurations = vec![root];
                if options.build_dependencies {
                    let mut seen = HashSet::from([*configuration_id]);
                    let mut queue: VecDeque<(u32, u32)> = configurations[0]
                        .dependency_ids
                        .iter()
                        .map(|dependency| (*configuration_id, *dependency))
                        .collect();
                    while let Some((dependant, dependency)) = queue.pop_front() {
                        if !seen.insert(dependency) {
                            continue;
                        }
                        let configuration =
                            self.configurations.latest(dependency).ok_or_else(|| {
                                BuildflowError::validation(format!(
                                    "Dependency {dependency} of configuration {dependant} does not exist"
                                ))
                            })?;
                        queue.extend(
                            configuration
                                .dependency_ids
                                .iter()
                                .map(|next| (dependency, *next)),
                        );
                        configurations.push(configuration);
                    }
                }
                Ok(Submission {
                    name,
                    configuration_set_id: None,
                    milestone_record_set_id: None,
                    configurations,
                })
            }
            BuildTarget::Group(set) => {
                if set.configuration_ids.is_empty() {
                    return Err(BuildflowError::validation(format!(
                        "Configuration set {} has no configurations",
                        set.id
                    )));
                }
                let mut seen = HashSet::new();
                let mut configurations = Vec::with_capacity(set.configuration_ids.len());
                for configuration_id in &set.configuration_ids {
                    if !seen.insert(*configuration_id) {
                        continue;
                    }
                    let configuration =
                        self.configurations.latest(*configuration_id).ok_or_else(|| {
                            BuildflowError::validation(format!(
                                "Configuration {configuration_id} of set {} does not exist",
                                set.name
                            ))
                        })?;
                    configurations.push(configuration);
                }
                Ok(Submission {
                    name: set.name.clone(),
                    configuration_set_id: Some(set.id),
                    milestone_record_set_id: set.milestone_record_set_id,
                    configurations,
                })
            }
        }
    }

    /// Moves a task to `status` and cascades: a failure rejects pending
    /// dependants, a success enqueues dependants that became ready.
    fn update_status(
        &self,
        state: &mut State,
        task_id: TaskId,
        status: BuildStatus,
        description: Option<String>,
        effects: &mut Effects,
    ) {
        let mut queue = VecDeque::from([(task_id, status, description)]);
        while let Some((id, status, description)) = queue.pop_front() {
            if !self.transition(state, id, status, description, effects) {
                continue;
            }
            if !status.is_completed() {
                continue;
            }
            for dependant in state.graph.dependants(id) {
                if status.has_failed() {
                    if state.tasks.get(&dependant).is_some_and(BuildTask::is_pending) {
                        queue.push_back((
                            dependant,
                            BuildStatus::Rejected,
                            Some(format!("Dependency {id} finished with status {status}")),
                        ));
                    }
                } else if state.is_ready(dependant) {
                    queue.push_back((dependant, BuildStatus::Enqueued, None));
                }
            }
        }
    }

    /// Applies one status change. Terminal statuses are final, so repeated
    /// changes are ignored and return false.
    fn transition(
        &self,
        state: &mut State,
        task_id: TaskId,
        status: BuildStatus,
        description: Option<String>,
        effects: &mut Effects,
    ) -> bool {
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return false;
        };
        if task.is_completed() || task.status == status {
            return false;
        }
        let old_status = task.status;
        task.status = status;
        if description.is_some() {
            task.status_description = description;
        }
        if status == BuildStatus::Building && task.start_time.is_none() {
            task.start_time = Some(now_utc());
        }
        if status.is_completed() {
            let end_time = now_utc();
            task.end_time = Some(end_time);
            task.live_logs_uri = None;
            task.failed = status.has_failed();
            effects.records.push(task.record());
            info!(
                task_id,
                configuration = %task.id_rev(),
                status = %status,
                duration_ms = elapsed_ms(&task.submit_time, &end_time),
                description = task.status_description.as_deref().unwrap_or(""),
                "Build task finished"
            );
        }
        if status == BuildStatus::Enqueued {
            effects.starts.push(Start {
                task_id,
                configuration: task.execution_configuration(),
                access_token: task.user.login_token.clone(),
            });
        }
        let event = BuildStatusChangedEvent::new(
            task_id,
            task.id_rev(),
            task.user.id,
            old_status,
            status,
        )
        .with_description(task.status_description.clone());
        let set_id = task.build_set_id;
        self.sink.on_build_status(&event);

        let set_event = state
            .sets
            .get(&set_id)
            .and_then(|set| set.on_member_status(task_id, status));
        if let Some(set_event) = set_event {
            self.sink.on_build_set_status(&set_event);
            if set_event.new_status.is_completed() {
                state.release_set(set_id);
            }
        }
        true
    }

    /// Carries out collected work, including work produced by failed starts.
    fn apply(self: &Arc<Self>, effects: Effects) {
        let mut pending = effects;
        while !pending.is_empty() {
            let Effects {
                starts,
                cancels,
                records,
            } = std::mem::take(&mut pending);
            for record in records {
                let task_id = record.task_id;
                if let Err(e) = self.records.store(record) {
                    warn!(task_id, error = %format!("{e:#}"), "Cannot store build record");
                }
            }
            for task_id in cancels {
                self.executor.cancel(task_id);
            }
            for start in starts {
                let more = self.start(start);
                pending.starts.extend(more.starts);
                pending.cancels.extend(more.cancels);
                pending.records.extend(more.records);
            }
        }
    }

    fn start(self: &Arc<Self>, start: Start) -> Effects {
        let Start {
            task_id,
            configuration,
            access_token,
        } = start;
        let inner = Arc::downgrade(self);
        let on_status: ExecutionStatusCallback = Arc::new(
            move |session: &BuildExecutionSession, event: &BuildExecutionStatusChangedEvent| {
                if let Some(inner) = inner.upgrade() {
                    inner.on_execution_status(session, event);
                }
            },
        );
        debug!(task_id, configuration = %configuration.id_rev, "Starting build execution");
        let started = self
            .executor
            .start_building(configuration, on_status, &access_token);

        let mut effects = Effects::default();
        let mut state = self.state.lock();
        match started {
            Ok(_) => {
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.execution_started = true;
                    if task.cancel_requested && !task.is_completed() {
                        effects.cancels.push(task_id);
                    }
                }
            }
            Err(e) => {
                warn!(task_id, error = %e, "Cannot start build execution");
                self.update_status(
                    &mut state,
                    task_id,
                    BuildStatus::SystemError,
                    Some(e.to_string()),
                    &mut effects,
                );
            }
        }
        effects
    }

    fn on_execution_status(
        self: &Arc<Self>,
        session: &BuildExecutionSession,
        event: &BuildExecutionStatusChangedEvent,
    ) {
        let task_id = event.execution_id;
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock();
            self.sink.on_execution_status(event);
            let Some(task) = state.tasks.get_mut(&task_id) else {
                debug!(task_id, status = %event.new_status, "Execution status for unknown task");
                return;
            };
            if is_final(session, event.new_status) {
                task.build_driver_result = session.build_driver_result();
                task.repository_result = session.repository_result();
                let (status, description) = outcome(session, event.new_status);
                self.update_status(&mut state, task_id, status, description, &mut effects);
            } else {
                if task.live_logs_uri.is_none() && !task.is_completed() {
                    task.live_logs_uri = session.live_logs_uri();
                }
                if task.status == BuildStatus::Enqueued {
                    self.update_status(
                        &mut state,
                        task_id,
                        BuildStatus::Building,
                        None,
                        &mut effects,
                    );
                }
            }
        }
        self.apply(effects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BuildConfigurationSet;
    use crate::events::CollectingStatusSink;
    use crate::spi::{InMemoryBuildRecordStore, InMemoryConfigurationSource};
    use crate::testing::RecordingExecutor;
    use pretty_assertions::assert_eq;

    use BuildStatus as S;

    struct Fixture {
        coordinator: BuildCoordinator,
        executor: Arc<RecordingExecutor>,
        sink: Arc<CollectingStatusSink>,
        records: Arc<InMemoryBuildRecordStore>,
    }

    /// Configurations 1..=4: 2 and 3 depend on 1, 4 depends on 2 and 3.
    fn diamond_source() -> InMemoryConfigurationSource {
        InMemoryConfigurationSource::new()
            .with_configuration(BuildConfigurationAudited::new(1, 1, "core"))
            .with_configuration(BuildConfigurationAudited::new(2, 1, "api").with_dependency(1))
            .with_configuration(BuildConfigurationAudited::new(3, 1, "impl").with_dependency(1))
            .with_configuration(
                BuildConfigurationAudited::new(4, 1, "app")
                    .with_dependency(2)
                    .with_dependency(3)
                    .with_milestone_record_set(70),
            )
    }

    fn fixture(source: InMemoryConfigurationSource) -> Fixture {
        let executor = Arc::new(RecordingExecutor::new());
        let sink = Arc::new(CollectingStatusSink::new());
        let records = Arc::new(InMemoryBuildRecordStore::new());
        let coordinator = BuildCoordinator::builder(executor.clone(), Arc::new(source))
            .with_status_sink(sink.clone())
            .with_record_store(records.clone())
            .with_config(CoordinatorConfig { first_task_id: 100 })
            .build();
        Fixture {
            coordinator,
            executor,
            sink,
            records,
        }
    }

    fn user() -> User {
        User::new(5, "demo").with_login_token("token-5")
    }

    /// Task id of a configuration within the submitted set.
    fn task_of(fixture: &Fixture, set: &BuildSetTask, configuration_id: u32) -> TaskId {
        set.task_ids()
            .into_iter()
            .find(|id| {
                fixture
                    .coordinator
                    .task(*id)
                    .is_some_and(|task| task.id_rev().id == configuration_id)
            })
            .unwrap()
    }

    #[test]
    fn test_submit_walks_dependencies_and_starts_roots() {
        let fixture = fixture(diamond_source());
        let set = fixture
            .coordinator
            .submit(BuildTarget::Configuration(4), &user(), BuildOptions::default())
            .unwrap();

        assert_eq!(set.task_ids().len(), 4);
        let core = task_of(&fixture, &set, 1);
        let app = task_of(&fixture, &set, 4);
        assert_eq!(fixture.executor.started(), vec![core]);
        assert_eq!(fixture.coordinator.task(core).unwrap().status, S::Building);
        assert_eq!(
            fixture.coordinator.task(app).unwrap().status,
            S::WaitingForDependencies
        );
        assert_eq!(fixture.coordinator.dependencies(app).len(), 2);
        assert_eq!(fixture.coordinator.task(app).unwrap().build_record_set_ids, vec![70]);
        assert!(set.task_ids().iter().all(|id| *id >= 100));
    }

    #[test]
    fn test_without_build_dependencies_only_root_is_built() {
        let fixture = fixture(diamond_source());
        let set = fixture
            .coordinator
            .submit(
                BuildTarget::Configuration(4),
                &user(),
                BuildOptions::default().with_build_dependencies(false),
            )
            .unwrap();
        assert_eq!(set.task_ids().len(), 1);
        assert_eq!(fixture.executor.started().len(), 1);
    }

    #[test]
    fn test_success_enqueues_dependants_once() {
        let fixture = fixture(diamond_source());
        let set = fixture
            .coordinator
            .submit(BuildTarget::Configuration(4), &user(), BuildOptions::default())
            .unwrap();
        let (core, api, implementation, app) = (
            task_of(&fixture, &set, 1),
            task_of(&fixture, &set, 2),
            task_of(&fixture, &set, 3),
            task_of(&fixture, &set, 4),
        );

        fixture.executor.succeed(core);
        assert_eq!(fixture.executor.started(), vec![core, api, implementation]);

        fixture.executor.succeed(implementation);
        assert_eq!(fixture.executor.started().len(), 3);
        fixture.executor.succeed(api);
        assert_eq!(fixture.executor.started(), vec![core, api, implementation, app]);

        fixture.executor.succeed(app);
        assert_eq!(set.status(), crate::core::BuildSetStatus::Success);
        assert_eq!(
            fixture.sink.statuses_of(app),
            vec![S::WaitingForDependencies, S::Enqueued, S::Building, S::Success]
        );
        assert!(fixture.coordinator.tasks().is_empty());
        assert_eq!(fixture.records.records().len(), 4);
    }

    #[test]
    fn test_failure_rejects_diamond_dependant_once() {
        let fixture = fixture(diamond_source());
        let set = fixture
            .coordinator
            .submit(BuildTarget::Configuration(4), &user(), BuildOptions::default())
            .unwrap();
        let core = task_of(&fixture, &set, 1);
        let app = task_of(&fixture, &set, 4);

        fixture.executor.fail(core, "compilation failed");

        assert_eq!(fixture.executor.started(), vec![core]);
        assert_eq!(set.task_status(core), Some(S::Failed));
        assert_eq!(set.task_status(app), Some(S::Rejected));
        assert_eq!(
            fixture.sink.statuses_of(app),
            vec![S::WaitingForDependencies, S::Rejected]
        );
        let record = fixture.records.record_for(core).unwrap();
        assert_eq!(record.status, S::Failed);
        assert!(record
            .description
            .unwrap()
            .contains("compilation failed"));
        assert_eq!(set.status(), crate::core::BuildSetStatus::Failed);
    }

    #[test]
    fn test_conflict_unless_forced() {
        let fixture = fixture(diamond_source());
        let set = fixture
            .coordinator
            .submit(BuildTarget::Configuration(1), &user(), BuildOptions::default())
            .unwrap();
        let core = set.task_ids()[0];

        let again = fixture
            .coordinator
            .submit(BuildTarget::Configuration(1), &user(), BuildOptions::default());
        match again {
            Err(BuildflowError::Conflict(e)) => assert_eq!(e.existing_task_id, Some(core)),
            other => panic!("unexpected result: {other:?}"),
        }

        let forced = fixture.coordinator.submit(
            BuildTarget::Configuration(1),
            &user(),
            BuildOptions::default().with_force_rebuild(true),
        );
        assert!(forced.is_ok());
    }

    #[test]
    fn test_unknown_configuration_is_validation_error() {
        let fixture = fixture(
            InMemoryConfigurationSource::new()
                .with_configuration(BuildConfigurationAudited::new(1, 1, "core").with_dependency(9)),
        );
        let missing_root =
            fixture
                .coordinator
                .submit(BuildTarget::Configuration(2), &user(), BuildOptions::default());
        assert!(matches!(missing_root, Err(BuildflowError::Validation(_))));

        let missing_dependency =
            fixture
                .coordinator
                .submit(BuildTarget::Configuration(1), &user(), BuildOptions::default());
        assert!(matches!(missing_dependency, Err(BuildflowError::Validation(_))));
        assert!(fixture.executor.started().is_empty());
    }

    #[test]
    fn test_group_wires_only_member_edges() {
        let fixture = fixture(diamond_source());
        let group = BuildConfigurationSet::new(8, "release", vec![2, 4, 2])
            .with_milestone_record_set(33);
        let set = fixture
            .coordinator
            .submit(BuildTarget::Group(group), &user(), BuildOptions::default())
            .unwrap();

        assert_eq!(set.task_ids().len(), 2);
        assert_eq!(set.configuration_set_id(), Some(8));
        let api = task_of(&fixture, &set, 2);
        let app = task_of(&fixture, &set, 4);
        assert!(fixture.coordinator.dependencies(api).is_empty());
        assert_eq!(fixture.coordinator.dependencies(app), vec![api]);
        assert_eq!(fixture.executor.started(), vec![api]);
        assert_eq!(
            fixture.coordinator.task(app).unwrap().build_record_set_ids,
            vec![33, 70]
        );

        let empty = BuildConfigurationSet::new(9, "empty", Vec::new());
        assert!(matches!(
            fixture
                .coordinator
                .submit(BuildTarget::Group(empty), &user(), BuildOptions::default()),
            Err(BuildflowError::Validation(_))
        ));
    }

    #[test]
    fn test_start_failure_is_system_error_and_rejects_dependants() {
        let fixture = fixture(diamond_source());
        fixture.executor.refuse_starts(true);
        let set = fixture
            .coordinator
            .submit(BuildTarget::Configuration(4), &user(), BuildOptions::default())
            .unwrap();
        let core = *set.task_ids().last().unwrap();

        assert_eq!(fixture.executor.started(), Vec::<TaskId>::new());
        assert_eq!(set.task_status(core), Some(S::SystemError));
        for id in set.task_ids().into_iter().filter(|id| *id != core) {
            assert_eq!(set.task_status(id), Some(S::Rejected));
        }
        let record = fixture.records.record_for(core).unwrap();
        assert!(record.description.unwrap().contains("no executor capacity"));
    }

    #[test]
    fn test_cancel_waiting_task_rejects_dependants() {
        let fixture = fixture(diamond_source());
        let set = fixture
            .coordinator
            .submit(BuildTarget::Configuration(4), &user(), BuildOptions::default())
            .unwrap();
        let api = task_of(&fixture, &set, 2);
        let app = task_of(&fixture, &set, 4);

        assert!(fixture.coordinator.cancel(api));
        assert_eq!(fixture.coordinator.task(api).unwrap().status, S::Cancelled);
        assert_eq!(fixture.coordinator.task(app).unwrap().status, S::Rejected);
        assert!(!fixture.coordinator.cancel(api));
        assert!(fixture.executor.cancelled().is_empty());
    }

    #[test]
    fn test_cancel_running_task_goes_through_executor() {
        let fixture = fixture(diamond_source());
        let set = fixture
            .coordinator
            .submit(BuildTarget::Configuration(1), &user(), BuildOptions::default())
            .unwrap();
        let core = set.task_ids()[0];

        assert!(fixture.coordinator.cancel(core));
        assert_eq!(fixture.executor.cancelled(), vec![core]);
        assert!(fixture.coordinator.running_execution(core).unwrap().is_cancelled());

        fixture
            .executor
            .finish(core, BuildExecutionStatus::Cancelled, None);
        assert_eq!(set.task_status(core), Some(S::Cancelled));
        assert_eq!(set.status(), crate::core::BuildSetStatus::Cancelled);
    }

    #[test]
    fn test_live_log_link_follows_session() {
        let fixture = fixture(diamond_source());
        let set = fixture
            .coordinator
            .submit(BuildTarget::Configuration(1), &user(), BuildOptions::default())
            .unwrap();
        let core = set.task_ids()[0];
        let session = fixture.coordinator.running_execution(core).unwrap();

        session.set_live_logs_uri("ws://agent/socket/text/ro");
        session.set_status(BuildExecutionStatus::BuildWaiting);
        assert_eq!(
            fixture.coordinator.task(core).unwrap().live_logs_uri.as_deref(),
            Some("ws://agent/socket/text/ro")
        );
        assert_eq!(session.access_token(), "token-5");
    }

    #[test]
    fn test_system_fault_is_system_error() {
        let fixture = fixture(diamond_source());
        let group = BuildConfigurationSet::new(8, "pair", vec![1, 3]);
        let set = fixture
            .coordinator
            .submit(BuildTarget::Group(group), &user(), BuildOptions::default())
            .unwrap();
        let core = task_of(&fixture, &set, 1);
        let implementation = task_of(&fixture, &set, 3);

        fixture.executor.finish(
            core,
            BuildExecutionStatus::DoneWithErrors,
            Some(BuildflowError::system("environment vanished")),
        );
        assert_eq!(set.task_status(core), Some(S::SystemError));
        assert_eq!(set.task_status(implementation), Some(S::Rejected));
    }

    #[test]
    fn test_result_collection_failure_is_failed() {
        let fixture = fixture(diamond_source());
        let set = fixture
            .coordinator
            .submit(BuildTarget::Configuration(1), &user(), BuildOptions::default())
            .unwrap();
        let core = set.task_ids()[0];
        fixture.executor.finish(
            core,
            BuildExecutionStatus::DoneWithErrors,
            Some(BuildflowError::result_collection("storage full")),
        );
        assert_eq!(set.task_status(core), Some(S::Failed));
        assert!(fixture
            .records
            .record_for(core)
            .unwrap()
            .description
            .unwrap()
            .contains("storage full"));
    }

    #[test]
    fn test_shutdown_cancels_and_refuses_submissions() {
        let fixture = fixture(diamond_source());
        let set = fixture
            .coordinator
            .submit(BuildTarget::Configuration(4), &user(), BuildOptions::default())
            .unwrap();
        let core = task_of(&fixture, &set, 1);

        fixture.coordinator.shutdown();

        assert_eq!(fixture.executor.cancelled(), vec![core]);
        assert!(fixture.coordinator.task(task_of(&fixture, &set, 4)).is_some_and(
            |task| task.status == S::Cancelled || task.status == S::Rejected
        ));
        assert!(matches!(
            fixture
                .coordinator
                .submit(BuildTarget::Configuration(1), &user(), BuildOptions::default()),
            Err(BuildflowError::System(_))
        ));
    }
}
