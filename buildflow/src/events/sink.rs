//! Status sink trait and implementations.

use super::event::{
    BuildExecutionStatusChangedEvent, BuildSetStatusChangedEvent, BuildStatusChangedEvent,
};
use crate::utils::format_iso8601;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

/// Receives every status transition produced by the coordinator and executor.
///
/// Implementations must not block and must never panic; they are called from
/// status-change handlers.
pub trait StatusSink: Send + Sync {
    /// A build task changed status.
    fn on_build_status(&self, event: &BuildStatusChangedEvent);

    /// An execution session changed status.
    fn on_execution_status(&self, _event: &BuildExecutionStatusChangedEvent) {}

    /// A build set changed status.
    fn on_build_set_status(&self, _event: &BuildSetStatusChangedEvent) {}
}

/// A sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpStatusSink;

impl StatusSink for NoOpStatusSink {
    fn on_build_status(&self, _event: &BuildStatusChangedEvent) {}
}

/// A sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingStatusSink {
    level: Level,
}

impl Default for LoggingStatusSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingStatusSink {
    /// Creates a logging sink with the specified level.
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub const fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl StatusSink for LoggingStatusSink {
    fn on_build_status(&self, event: &BuildStatusChangedEvent) {
        if self.level == Level::DEBUG {
            debug!(
                task_id = event.task_id,
                configuration = %event.id_rev,
                old_status = %event.old_status,
                new_status = %event.new_status,
                description = ?event.description,
                "Build status changed"
            );
        } else {
            info!(
                task_id = event.task_id,
                configuration = %event.id_rev,
                old_status = %event.old_status,
                new_status = %event.new_status,
                description = ?event.description,
                "Build status changed"
            );
        }
    }

    fn on_execution_status(&self, event: &BuildExecutionStatusChangedEvent) {
        debug!(
            execution_id = event.execution_id,
            old_status = %event.old_status,
            new_status = %event.new_status,
            "Execution status changed"
        );
    }

    fn on_build_set_status(&self, event: &BuildSetStatusChangedEvent) {
        info!(
            build_set_id = event.build_set_id,
            name = %event.name,
            old_status = %event.old_status,
            new_status = %event.new_status,
            at = %format_iso8601(&event.at),
            "Build set status changed"
        );
    }
}

/// A collecting sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingStatusSink {
    builds: RwLock<Vec<BuildStatusChangedEvent>>,
    executions: RwLock<Vec<BuildExecutionStatusChangedEvent>>,
    sets: RwLock<Vec<BuildSetStatusChangedEvent>>,
}

impl CollectingStatusSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected build status events.
    #[must_use]
    pub fn build_events(&self) -> Vec<BuildStatusChangedEvent> {
        self.builds.read().clone()
    }

    /// Returns all collected execution status events.
    #[must_use]
    pub fn execution_events(&self) -> Vec<BuildExecutionStatusChangedEvent> {
        self.executions.read().clone()
    }

    /// Returns all collected build set events.
    #[must_use]
    pub fn build_set_events(&self) -> Vec<BuildSetStatusChangedEvent> {
        self.sets.read().clone()
    }

    /// Returns the sequence of statuses one task went through.
    #[must_use]
    pub fn statuses_of(&self, task_id: u32) -> Vec<crate::core::BuildStatus> {
        self.builds
            .read()
            .iter()
            .filter(|e| e.task_id == task_id)
            .map(|e| e.new_status)
            .collect()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.builds.read().is_empty()
            && self.executions.read().is_empty()
            && self.sets.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.builds.write().clear();
        self.executions.write().clear();
        self.sets.write().clear();
    }
}

impl StatusSink for CollectingStatusSink {
    fn on_build_status(&self, event: &BuildStatusChangedEvent) {
        self.builds.write().push(event.clone());
    }

    fn on_execution_status(&self, event: &BuildExecutionStatusChangedEvent) {
        self.executions.write().push(event.clone());
    }

    fn on_build_set_status(&self, event: &BuildSetStatusChangedEvent) {
        self.sets.write().push(event.clone());
    }
}
