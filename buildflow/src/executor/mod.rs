//! Build execution.
//!
//! An executor runs one [`BuildExecutionSession`] per started build through
//! a fixed sequence of stages: configure the repository, provision an
//! environment, run the remote build, collect results, and tear down.

mod default;
mod pipeline;
mod session;

pub use default::{BuildExecutor, DefaultBuildExecutor};
pub use pipeline::{
    advance, final_status, first_stage, live_logs_uri, BuildProcessError, Stage,
    LIVE_LOG_SOCKET_PATH,
};
pub use session::{BuildExecutionSession, ExecutionStatusCallback};
