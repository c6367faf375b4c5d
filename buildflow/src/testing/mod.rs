//! Testing utilities for buildflow.
//!
//! This module provides:
//! - An in-memory compute backend and a switchable liveness probe
//! - Scripted repository, environment and build driver collaborators
//! - A recording executor for coordinator tests

mod compute;
mod executor;
mod mocks;

pub use compute::{InMemoryComputeBackend, StaticLivenessProbe};
pub use executor::RecordingExecutor;
pub use mocks::{
    BuildBehavior, EnvironmentBehavior, ScriptedBuildDriver, ScriptedEnvironmentDriver,
    StubRepositoryManager, StubRepositorySession,
};
