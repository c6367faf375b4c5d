//! Configuration lookup contract.

use crate::core::BuildConfigurationAudited;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Resolves configuration ids to their latest audited revision.
pub trait ConfigurationSource: Send + Sync {
    /// Latest revision of a configuration, if it exists.
    fn latest(&self, configuration_id: u32) -> Option<BuildConfigurationAudited>;
}

/// A configuration source backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryConfigurationSource {
    configurations: RwLock<HashMap<u32, BuildConfigurationAudited>>,
}

impl InMemoryConfigurationSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a configuration and returns the source.
    #[must_use]
    pub fn with_configuration(self, configuration: BuildConfigurationAudited) -> Self {
        self.insert(configuration);
        self
    }

    /// Inserts or replaces a configuration.
    pub fn insert(&self, configuration: BuildConfigurationAudited) {
        self.configurations
            .write()
            .insert(configuration.id_rev.id, configuration);
    }
}

impl ConfigurationSource for InMemoryConfigurationSource {
    fn latest(&self, configuration_id: u32) -> Option<BuildConfigurationAudited> {
        self.configurations.read().get(&configuration_id).cloned()
    }
}
