//! Observability utilities.

mod logging;

pub use logging::{environment_span, execution_span, init_tracing};
