//! Data model shared by the coordinator, executor and environment driver.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier of a build task. The executor reuses it as the execution id.
pub type TaskId = u32;

/// Identifier of a build set task.
pub type BuildSetId = u32;

/// Identity of an audited configuration revision.
///
/// Two build tasks are equal iff they share this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdRev {
    /// Configuration id.
    pub id: u32,
    /// Audited revision.
    pub rev: u32,
}

impl IdRev {
    /// Creates a new identity.
    #[must_use]
    pub const fn new(id: u32, rev: u32) -> Self {
        Self { id, rev }
    }
}

impl fmt::Display for IdRev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.rev)
    }
}

/// One audited revision of a build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfigurationAudited {
    /// Configuration revision identity.
    pub id_rev: IdRev,
    /// Display name.
    pub name: String,
    /// Script the build driver runs.
    #[serde(default)]
    pub build_script: String,
    /// Source repository.
    #[serde(default)]
    pub scm_repo_url: String,
    /// Source revision.
    #[serde(default)]
    pub scm_revision: String,
    /// Builder image override.
    #[serde(default)]
    pub image_id: Option<String>,
    /// Ids of the configurations this one depends on.
    #[serde(default)]
    pub dependency_ids: Vec<u32>,
    /// Free-form build parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Record-set ids of the product milestones this configuration is part of.
    #[serde(default)]
    pub milestone_record_set_ids: Vec<u32>,
}

impl BuildConfigurationAudited {
    /// Creates a configuration revision without dependencies.
    #[must_use]
    pub fn new(id: u32, rev: u32, name: impl Into<String>) -> Self {
        Self {
            id_rev: IdRev::new(id, rev),
            name: name.into(),
            build_script: String::new(),
            scm_repo_url: String::new(),
            scm_revision: String::new(),
            image_id: None,
            dependency_ids: Vec::new(),
            parameters: HashMap::new(),
            milestone_record_set_ids: Vec::new(),
        }
    }

    /// Adds a dependency on another configuration id.
    #[must_use]
    pub fn with_dependency(mut self, configuration_id: u32) -> Self {
        if !self.dependency_ids.contains(&configuration_id) {
            self.dependency_ids.push(configuration_id);
        }
        self
    }

    /// Sets the build script.
    #[must_use]
    pub fn with_build_script(mut self, script: impl Into<String>) -> Self {
        self.build_script = script.into();
        self
    }

    /// Sets a build parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Adds a product milestone record-set id.
    #[must_use]
    pub fn with_milestone_record_set(mut self, record_set_id: u32) -> Self {
        self.milestone_record_set_ids.push(record_set_id);
        self
    }
}

/// A named group of configurations built together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfigurationSet {
    /// Set id.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Member configuration ids.
    pub configuration_ids: Vec<u32>,
    /// Record-set id of the product milestone the set builds for.
    #[serde(default)]
    pub milestone_record_set_id: Option<u32>,
}

impl BuildConfigurationSet {
    /// Creates a new configuration set.
    #[must_use]
    pub fn new(id: u32, name: impl Into<String>, configuration_ids: Vec<u32>) -> Self {
        Self {
            id,
            name: name.into(),
            configuration_ids,
            milestone_record_set_id: None,
        }
    }

    /// Sets the milestone record-set id.
    #[must_use]
    pub fn with_milestone_record_set(mut self, record_set_id: u32) -> Self {
        self.milestone_record_set_id = Some(record_set_id);
        self
    }
}

/// What a submission builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildTarget {
    /// One configuration, plus its dependencies when requested.
    Configuration(u32),
    /// Every member of a configuration set.
    Group(BuildConfigurationSet),
}

/// The user on whose behalf a build runs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id.
    pub id: u32,
    /// Login name.
    pub username: String,
    /// Access token forwarded to collaborators.
    #[serde(default, skip_serializing)]
    pub login_token: String,
}

impl User {
    /// Creates a new user.
    #[must_use]
    pub fn new(id: u32, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            login_token: String::new(),
        }
    }

    /// Sets the access token.
    #[must_use]
    pub fn with_login_token(mut self, token: impl Into<String>) -> Self {
        self.login_token = token.into();
        self
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("login_token", &"***")
            .finish()
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Skip the "already building" conflict check.
    #[serde(default)]
    pub force_rebuild: bool,
    /// Walk declared dependencies of a single-configuration submission.
    #[serde(default = "default_build_dependencies")]
    pub build_dependencies: bool,
    /// Keep a failed build's environment reachable over SSH.
    #[serde(default)]
    pub keep_pod_on_failure: bool,
    /// Mark produced artifacts as temporary.
    #[serde(default)]
    pub temporary_build: bool,
}

const fn default_build_dependencies() -> bool {
    true
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            force_rebuild: false,
            build_dependencies: default_build_dependencies(),
            keep_pod_on_failure: false,
            temporary_build: false,
        }
    }
}

impl BuildOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `force_rebuild`.
    #[must_use]
    pub const fn with_force_rebuild(mut self, force: bool) -> Self {
        self.force_rebuild = force;
        self
    }

    /// Sets `build_dependencies`.
    #[must_use]
    pub const fn with_build_dependencies(mut self, build: bool) -> Self {
        self.build_dependencies = build;
        self
    }

    /// Sets `keep_pod_on_failure`.
    #[must_use]
    pub const fn with_keep_pod_on_failure(mut self, keep: bool) -> Self {
        self.keep_pod_on_failure = keep;
        self
    }

    /// Sets `temporary_build`.
    #[must_use]
    pub const fn with_temporary_build(mut self, temporary: bool) -> Self {
        self.temporary_build = temporary;
        self
    }
}

/// Everything the executor needs to run one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildExecutionConfiguration {
    /// Execution id, equal to the task id.
    pub id: TaskId,
    /// Configuration revision being built.
    pub id_rev: IdRev,
    /// Display name.
    pub name: String,
    /// Script the build driver runs.
    pub build_script: String,
    /// Source repository.
    pub scm_repo_url: String,
    /// Source revision.
    pub scm_revision: String,
    /// Builder image override.
    pub image_id: Option<String>,
    /// Build parameters.
    pub parameters: HashMap<String, String>,
    /// Id of the requesting user.
    pub user_id: u32,
    /// Keep the environment for debugging when the build fails.
    pub keep_pod_on_failure: bool,
    /// Artifacts are temporary.
    pub temporary_build: bool,
}

impl BuildExecutionConfiguration {
    /// Builds an execution configuration for a task.
    #[must_use]
    pub fn for_task(
        id: TaskId,
        configuration: &BuildConfigurationAudited,
        user: &User,
        options: BuildOptions,
    ) -> Self {
        Self {
            id,
            id_rev: configuration.id_rev,
            name: configuration.name.clone(),
            build_script: configuration.build_script.clone(),
            scm_repo_url: configuration.scm_repo_url.clone(),
            scm_revision: configuration.scm_revision.clone(),
            image_id: configuration.image_id.clone(),
            parameters: configuration.parameters.clone(),
            user_id: user.id,
            keep_pod_on_failure: options.keep_pod_on_failure,
            temporary_build: options.temporary_build,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_rev_display_and_eq() {
        let a = IdRev::new(3, 9);
        assert_eq!(a.to_string(), "3:9");
        assert_eq!(a, IdRev::new(3, 9));
        assert_ne!(a, IdRev::new(3, 10));
    }

    #[test]
    fn test_with_dependency_deduplicates() {
        let config = BuildConfigurationAudited::new(1, 1, "a")
            .with_dependency(2)
            .with_dependency(2)
            .with_dependency(3);
        assert_eq!(config.dependency_ids, vec![2, 3]);
    }

    #[test]
    fn test_user_debug_hides_token() {
        let user = User::new(1, "alice").with_login_token("secret-token");
        let rendered = format!("{user:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(!serde_json::to_string(&user).unwrap().contains("secret-token"));
    }

    #[test]
    fn test_build_options_defaults() {
        let options: BuildOptions = serde_json::from_str("{}").unwrap();
        assert!(options.build_dependencies);
        assert!(!options.force_rebuild);
        assert_eq!(options, BuildOptions::default());
    }
}
