//! Cooperative cancellation for execution pipelines.

mod token;

pub use token::{CancelHook, CancellationToken};
