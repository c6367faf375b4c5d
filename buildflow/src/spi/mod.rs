//! Contracts for the external collaborators the core calls into.
//!
//! - [`RepositoryManager`] acquires an isolated build repository per execution
//! - [`BuildDriver`] runs the build inside a ready environment
//! - [`ConfigurationSource`] resolves configuration ids to audited revisions
//! - [`BuildRecordStore`] persists terminal build records

mod build_driver;
mod configuration;
mod records;
mod repository;

pub use build_driver::{
    BuildCompletion, BuildDriver, BuildDriverResult, BuildDriverStatus, BuildFailure, RunningBuild,
};
pub use configuration::{ConfigurationSource, InMemoryConfigurationSource};
pub use records::{BuildRecord, BuildRecordStore, InMemoryBuildRecordStore, NoOpBuildRecordStore};
pub use repository::{
    CompletionStatus, RepositoryConnectionInfo, RepositoryManager, RepositoryManagerResult,
    RepositorySession,
};

#[cfg(test)]
pub use repository::MockRepositoryManager;
