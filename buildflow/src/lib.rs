//! # Buildflow
//!
//! A build coordination service core.
//!
//! Buildflow accepts requests to build software configurations, orders them
//! over their dependency graph, and runs each build through a staged
//! execution pipeline:
//!
//! - **Coordination**: tasks start once every dependency succeeded; failures
//!   reject dependants transitively
//! - **Execution**: repository setup, environment provisioning, remote build,
//!   result collection and teardown, cancellable at every stage
//! - **Environments**: provisioned on a compute backend, monitored until
//!   ready and recreated within a retry budget
//! - **Status notifications**: every transition is published to a sink
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use buildflow::prelude::*;
//!
//! let executor = Arc::new(DefaultBuildExecutor::new(
//!     &ExecutorConfig::default(),
//!     repository_manager,
//!     environment_driver,
//!     build_driver,
//! ));
//! let coordinator = BuildCoordinator::builder(executor, configurations)
//!     .with_status_sink(Arc::new(LoggingStatusSink::default()))
//!     .build();
//!
//! let set = coordinator.submit(BuildTarget::Configuration(7), &user, BuildOptions::default())?;
//! let status = set.wait_for_completion().await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod environment;
pub mod errors;
pub mod events;
pub mod executor;
pub mod monitor;
pub mod observability;
pub mod spi;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        BuildflowConfig, CoordinatorConfig, EnvironmentConfig, ExecutorConfig, MonitorConfig,
    };
    pub use crate::coordinator::{BuildCoordinator, BuildSetTask, BuildTask};
    pub use crate::core::{
        BuildConfigurationAudited, BuildConfigurationSet, BuildExecutionStatus, BuildOptions,
        BuildSetStatus, BuildStatus, BuildTarget, IdRev, TaskId, User,
    };
    pub use crate::environment::{
        ComputeBackend, EnvironmentDriver, ProvisioningEnvironmentDriver, RecreationPolicy,
    };
    pub use crate::errors::{BuildflowError, BuildflowResult};
    pub use crate::events::{LoggingStatusSink, NoOpStatusSink, StatusSink};
    pub use crate::executor::{BuildExecutionSession, BuildExecutor, DefaultBuildExecutor};
    pub use crate::monitor::PollingMonitor;
    pub use crate::spi::{BuildDriver, BuildRecordStore, ConfigurationSource, RepositoryManager};
    pub use crate::utils::Timestamp;
}
