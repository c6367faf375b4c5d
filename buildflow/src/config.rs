//! Configuration types for the coordinator, executor, monitor and environment driver.
//!
//! Values come from serde defaults, optionally a JSON document, and finally
//! `BUILDFLOW_*` environment variables. An override that does not parse is
//! logged and the previous value is kept.

use crate::environment::RecreationPolicy;
use crate::errors::{BuildflowError, BuildflowResult};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildflowConfig {
    /// Coordinator settings.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Executor settings.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Polling monitor settings.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Environment driver settings.
    #[serde(default)]
    pub environment: EnvironmentConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BuildflowConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document. Missing sections fall back to defaults.
    pub fn from_json_str(json: &str) -> BuildflowResult<Self> {
        serde_json::from_str(json).map_err(|e| BuildflowError::Config(e.to_string()))
    }

    /// Reads and parses a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> BuildflowResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BuildflowError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Applies overrides from the process environment.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "BUILDFLOW_FIRST_TASK_ID", &mut self.coordinator.first_task_id);
        override_parsed(
            &lookup,
            "BUILDFLOW_EXECUTOR_THREAD_POOL_SIZE",
            &mut self.executor.thread_pool_size,
        );
        override_parsed(
            &lookup,
            "BUILDFLOW_MONITOR_SWEEP_PERIOD_MS",
            &mut self.monitor.sweep_period_ms,
        );
        override_parsed(&lookup, "BUILDFLOW_ENV_IMAGE_ID", &mut self.environment.image_id);
        override_parsed(
            &lookup,
            "BUILDFLOW_ENV_CREATION_POD_RETRY",
            &mut self.environment.recreation.max_retries,
        );
        override_parsed(
            &lookup,
            "BUILDFLOW_ENV_READINESS_CHECK_INTERVAL_MS",
            &mut self.environment.readiness_check_interval_ms,
        );
        override_parsed(
            &lookup,
            "BUILDFLOW_ENV_READINESS_TIMEOUT_MS",
            &mut self.environment.readiness_timeout_ms,
        );
        override_parsed(
            &lookup,
            "BUILDFLOW_ENV_EXPOSE_PUBLIC_URL",
            &mut self.environment.expose_build_agent_on_public_url,
        );
        override_parsed(
            &lookup,
            "BUILDFLOW_ENV_KEEP_INSTANCE",
            &mut self.environment.keep_build_agent_instance,
        );
        override_parsed(&lookup, "BUILDFLOW_LOG", &mut self.logging.filter);
        override_parsed(&lookup, "BUILDFLOW_LOG_JSON", &mut self.logging.json);
    }

    /// Sets the executor configuration.
    #[must_use]
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Sets the monitor configuration.
    #[must_use]
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Sets the environment configuration.
    #[must_use]
    pub fn with_environment(mut self, environment: EnvironmentConfig) -> Self {
        self.environment = environment;
        self
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(e) => warn!(
            key = %key,
            value = %raw,
            error = %e,
            "Ignoring unparsable configuration override"
        ),
    }
}

/// Coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// First id handed out to tasks and build sets.
    #[serde(default = "default_first_task_id")]
    pub first_task_id: u32,
}

const fn default_first_task_id() -> u32 {
    1
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            first_task_id: default_first_task_id(),
        }
    }
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of pipelines running at once.
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,
}

const fn default_thread_pool_size() -> usize {
    12
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: default_thread_pool_size(),
        }
    }
}

impl ExecutorConfig {
    /// Sets the worker pool size.
    #[must_use]
    pub const fn with_thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = size;
        self
    }
}

/// Polling monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Period of the timeout sweeper.
    #[serde(default = "default_sweep_period_ms")]
    pub sweep_period_ms: u64,
}

const fn default_readiness_check_interval_ms() -> u64 {
    1_000
}

const fn default_readiness_timeout_ms() -> u64 {
    300_000
}

const fn default_sweep_period_ms() -> u64 {
    250
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_period_ms: default_sweep_period_ms(),
        }
    }
}

impl MonitorConfig {
    /// Sets the sweeper period.
    #[must_use]
    pub const fn with_sweep_period_ms(mut self, period: u64) -> Self {
        self.sweep_period_ms = period;
        self
    }

    /// Sweeper period as a duration.
    #[must_use]
    pub const fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.sweep_period_ms)
    }
}

/// Environment driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Builder image used when a configuration does not name one.
    #[serde(default = "default_image_id")]
    pub image_id: String,
    /// Prefix of every generated resource name.
    #[serde(default = "default_resource_prefix")]
    pub resource_prefix: String,
    /// Interval between readiness checks.
    #[serde(default = "default_readiness_check_interval_ms")]
    pub readiness_check_interval_ms: u64,
    /// Readiness timeout for each resource.
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
    /// Create a public route for the build agent.
    #[serde(default)]
    pub expose_build_agent_on_public_url: bool,
    /// Never delete environments unless forced.
    #[serde(default)]
    pub keep_build_agent_instance: bool,
    /// Port the build agent listens on.
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    /// Path the build agent is mounted on.
    #[serde(default = "default_bind_path")]
    pub build_agent_bind_path: String,
    /// Working directory inside the container.
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
    /// Memory for the builder, in GiB.
    #[serde(default = "default_builder_pod_memory")]
    pub builder_pod_memory_gib: f64,
    /// Recreation bound and delay.
    #[serde(default)]
    pub recreation: RecreationPolicy,
}

fn default_image_id() -> String {
    "buildflow/builder:latest".to_string()
}

fn default_resource_prefix() -> String {
    "build-agent".to_string()
}

const fn default_container_port() -> u16 {
    8080
}

fn default_bind_path() -> String {
    "/build-agent".to_string()
}

fn default_working_directory() -> String {
    "/tmp/build".to_string()
}

const fn default_builder_pod_memory() -> f64 {
    4.0
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            image_id: default_image_id(),
            resource_prefix: default_resource_prefix(),
            readiness_check_interval_ms: default_readiness_check_interval_ms(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
            expose_build_agent_on_public_url: false,
            keep_build_agent_instance: false,
            container_port: default_container_port(),
            build_agent_bind_path: default_bind_path(),
            working_directory: default_working_directory(),
            builder_pod_memory_gib: default_builder_pod_memory(),
            recreation: RecreationPolicy::default(),
        }
    }
}

impl EnvironmentConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the readiness polling interval and timeout.
    #[must_use]
    pub const fn with_readiness(mut self, interval: Duration, timeout: Duration) -> Self {
        self.readiness_check_interval_ms = interval.as_millis() as u64;
        self.readiness_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets how many times a failed environment is recreated.
    #[must_use]
    pub const fn with_creation_retries(mut self, retries: u32) -> Self {
        self.recreation.max_retries = retries;
        self
    }

    /// Enables the public route.
    #[must_use]
    pub const fn with_public_url(mut self, expose: bool) -> Self {
        self.expose_build_agent_on_public_url = expose;
        self
    }

    /// Keeps environments alive unless destruction is forced.
    #[must_use]
    pub const fn with_keep_instance(mut self, keep: bool) -> Self {
        self.keep_build_agent_instance = keep;
        self
    }

    /// Readiness check interval as a duration.
    #[must_use]
    pub const fn readiness_check_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_check_interval_ms)
    }

    /// Readiness timeout as a duration.
    #[must_use]
    pub const fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive string.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}
