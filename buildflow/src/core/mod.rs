//! Core domain model types for buildflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Build, execution and build-set status enums
//! - Configuration revisions, users and submission options

mod model;
mod status;

pub use model::{
    BuildConfigurationAudited, BuildConfigurationSet, BuildExecutionConfiguration, BuildOptions,
    BuildSetId, BuildTarget, IdRev, TaskId, User,
};
pub use status::{BuildExecutionStatus, BuildSetStatus, BuildStatus};
