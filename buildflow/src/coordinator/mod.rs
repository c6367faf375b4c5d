//! Build coordination.
//!
//! The coordinator turns submissions into [`BuildTask`]s grouped in a
//! [`BuildSetTask`], tracks their dependencies in a [`TaskGraph`], and hands
//! tasks to a [`BuildExecutor`](crate::executor::BuildExecutor) as soon as
//! every dependency succeeded.

mod build_set;
#[allow(clippy::module_inception)]
mod coordinator;
mod graph;
mod task;


pub use build_set::BuildSetTask;
pub use coordinator::{BuildCoordinator, BuildCoordinatorBuilder};
pub use graph::TaskGraph;
pub use task::BuildTask;
