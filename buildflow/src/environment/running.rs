//! A provisioned, ready build environment.

use crate::spi::RepositorySession;
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Something whose remote resources can be torn down.
#[async_trait]
pub trait DestroyableEnvironment: Send + Sync {
    /// Deletes the environment's resources, honouring keep-instance and
    /// debug settings. Repeated calls are harmless.
    async fn destroy_environment(&self) -> anyhow::Result<()>;
}

/// Operations a running environment exposes beyond destruction.
#[async_trait]
pub trait EnvironmentHandle: DestroyableEnvironment {
    /// Starts the debug service and records the SSH command on the debug data.
    async fn enable_ssh(&self) -> anyhow::Result<()>;
}

/// Debug settings and SSH access details for one environment.
#[derive(Debug, Default)]
pub struct DebugData {
    enable_debug_on_failure: bool,
    debug_enabled: AtomicBool,
    ssh_password: RwLock<Option<String>>,
    ssh_command: RwLock<Option<String>>,
}

impl DebugData {
    /// Creates debug data.
    #[must_use]
    pub fn new(enable_debug_on_failure: bool) -> Self {
        Self {
            enable_debug_on_failure,
            ..Self::default()
        }
    }

    /// Whether a failed build should keep its environment for debugging.
    #[must_use]
    pub const fn is_enable_debug_on_failure(&self) -> bool {
        self.enable_debug_on_failure
    }

    /// Whether debugging is currently enabled.
    #[must_use]
    pub fn is_debug_enabled(&self) -> bool {
        self.debug_enabled.load(Ordering::SeqCst)
    }

    /// Enables or disables debugging.
    pub fn set_debug_enabled(&self, enabled: bool) {
        self.debug_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Generates and stores a fresh SSH password.
    pub fn generate_ssh_password(&self) -> String {
        let password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        *self.ssh_password.write() = Some(password.clone());
        password
    }

    /// The SSH password, once generated.
    #[must_use]
    pub fn ssh_password(&self) -> Option<String> {
        self.ssh_password.read().clone()
    }

    /// Records the command that opens an SSH session.
    pub fn set_ssh_command(&self, command: impl Into<String>) {
        *self.ssh_command.write() = Some(command.into());
    }

    /// The SSH command, once the debug service is up.
    #[must_use]
    pub fn ssh_command(&self) -> Option<String> {
        self.ssh_command.read().clone()
    }
}

/// A ready compute unit the build runs in.
#[derive(Clone)]
pub struct RunningEnvironment {
    /// Compute unit identity.
    pub id: String,
    /// Port the build agent listens on.
    pub port: u16,
    /// Build agent URL as seen by clients. Equals the internal URL when no
    /// public route exists.
    pub build_agent_url: String,
    /// Build agent URL inside the cluster.
    pub internal_url: String,
    /// Repository session bound to the environment.
    pub repository_session: Arc<dyn RepositorySession>,
    /// Working directory inside the container.
    pub working_directory: PathBuf,
    /// Debug settings.
    pub debug: Arc<DebugData>,
    handle: Arc<dyn EnvironmentHandle>,
}

impl RunningEnvironment {
    /// Creates a running environment.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        port: u16,
        build_agent_url: impl Into<String>,
        internal_url: impl Into<String>,
        repository_session: Arc<dyn RepositorySession>,
        working_directory: impl Into<PathBuf>,
        debug: Arc<DebugData>,
        handle: Arc<dyn EnvironmentHandle>,
    ) -> Self {
        Self {
            id: id.into(),
            port,
            build_agent_url: build_agent_url.into(),
            internal_url: internal_url.into(),
            repository_session,
            working_directory: working_directory.into(),
            debug,
            handle,
        }
    }

    /// Starts the debug service.
    pub async fn enable_ssh(&self) -> anyhow::Result<()> {
        self.handle.enable_ssh().await
    }

    /// Returns the environment as a destroyable reference.
    #[must_use]
    pub fn destroyable(&self) -> Arc<dyn DestroyableEnvironment> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl DestroyableEnvironment for RunningEnvironment {
    async fn destroy_environment(&self) -> anyhow::Result<()> {
        self.handle.destroy_environment().await
    }
}

impl std::fmt::Debug for RunningEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningEnvironment")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("build_agent_url", &self.build_agent_url)
            .field("internal_url", &self.internal_url)
            .field("working_directory", &self.working_directory)
            .field("debug_enabled", &self.debug.is_debug_enabled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_data_flags() {
        let debug = DebugData::new(true);
        assert!(debug.is_enable_debug_on_failure());
        assert!(!debug.is_debug_enabled());
        debug.set_debug_enabled(true);
        assert!(debug.is_debug_enabled());
    }

    #[test]
    fn test_ssh_password_generated_once_stored() {
        let debug = DebugData::new(true);
        assert!(debug.ssh_password().is_none());
        let password = debug.generate_ssh_password();
        assert_eq!(password.len(), 10);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(debug.ssh_password(), Some(password));
    }
}
