//! Tracing subscriber setup and span helpers.

use crate::config::LoggingConfig;
use crate::core::{IdRev, TaskId};
use crate::errors::{BuildflowError, BuildflowResult};
use tracing::{info_span, Span};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> BuildflowResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(config.json.then(|| fmt::layer().json()))
        .with((!config.json).then(fmt::layer))
        .try_init()
        .map_err(|e| BuildflowError::Config(format!("tracing already initialised: {e}")))
}

/// Span wrapping one execution pipeline.
#[must_use]
pub fn execution_span(execution_id: TaskId, id_rev: IdRev) -> Span {
    info_span!("build_execution", execution_id, configuration = %id_rev)
}

/// Span wrapping the provisioning of one environment.
#[must_use]
pub fn environment_span(environment_id: &str, attempt: u32) -> Span {
    info_span!("build_environment", environment_id = %environment_id, attempt)
}
