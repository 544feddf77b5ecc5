//! Plugin registry.

use std::{collections::BTreeMap, sync::Arc};

use hostpulse_config::GenericConfiguration;
use hostpulse_error::GenericError;
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

use crate::plugin::{Plugin, PluginSet};

type PluginFactory = Arc<dyn Fn(&GenericConfiguration) -> Result<Plugin, GenericError> + Send + Sync>;

/// A plugin registry error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RegistryError {
    /// No factory was registered under the requested name.
    #[snafu(display("Unknown plugin '{}'. Known plugins: {}.", name, known.join(", ")))]
    UnknownPlugin {
        /// Requested plugin name.
        name: String,

        /// Names of all registered plugins.
        known: Vec<String>,
    },

    /// The factory failed to build the plugin.
    #[snafu(display("Failed to build plugin '{}': {:#}", name, source))]
    FailedToBuild {
        /// Plugin name.
        name: String,

        /// Underlying error.
        source: GenericError,
    },
}

/// A plugin entry in the agent configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PluginEntry {
    /// Registered plugin name.
    pub name: String,

    /// Whether the plugin should be instantiated.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

/// Maps plugin names to factories.
///
/// Factories receive the full agent configuration and pick out their own section of it.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginRegistry {
    /// Registers a factory under the given name, replacing any existing factory with that name.
    pub fn register<N, F>(&mut self, name: N, factory: F)
    where
        N: Into<String>,
        F: Fn(&GenericConfiguration) -> Result<Plugin, GenericError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Returns `true` if a factory is registered under the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Builds the plugin registered under the given name.
    ///
    /// # Errors
    ///
    /// If no factory is registered under `name`, or the factory fails, an error is returned.
    pub fn build(&self, name: &str, config: &GenericConfiguration) -> Result<Plugin, RegistryError> {
        let factory = self.factories.get(name).ok_or_else(|| RegistryError::UnknownPlugin {
            name: name.to_string(),
            known: self.factories.keys().cloned().collect(),
        })?;

        factory(config).context(FailedToBuild { name })
    }

    /// Builds every enabled plugin listed in `entries`, in order.
    ///
    /// # Errors
    ///
    /// If any enabled plugin cannot be built, an error is returned.
    pub fn build_all(&self, entries: &[PluginEntry], config: &GenericConfiguration) -> Result<PluginSet, RegistryError> {
        let mut plugins = PluginSet::default();
        for entry in entries {
            if !entry.enabled {
                debug!(plugin = %entry.name, "Plugin is disabled. Skipping.");
                continue;
            }

            let plugin = self.build(&entry.name, config)?;
            debug!(plugin = %entry.name, ?plugin, "Built plugin.");
            plugins.add(plugin);
        }
        Ok(plugins)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use hostpulse_config::ConfigurationLoader;
    use hostpulse_error::generic_error;

    use super::*;
    use crate::{data_model::CollectableValue, plugin::Source};

    struct NullSource;

    #[async_trait]
    impl Source for NullSource {
        fn name(&self) -> &str {
            "null"
        }

        async fn read(&self) -> Result<Vec<CollectableValue>, GenericError> {
            Ok(Vec::new())
        }
    }

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::default();
        registry.register("null", |_| Ok(Plugin::Source(Arc::new(NullSource))));
        registry.register("broken", |_| Err(generic_error!("missing url")));
        registry
    }

    fn entry(name: &str, enabled: bool) -> PluginEntry {
        PluginEntry {
            name: name.to_string(),
            enabled,
        }
    }

    #[test]
    fn builds_enabled_plugins_only() {
        let config = ConfigurationLoader::default().into_generic();
        let plugins = registry()
            .build_all(&[entry("null", true), entry("broken", false)], &config)
            .unwrap();

        assert_eq!(plugins.sources().len(), 1);
        assert!(plugins.destinations().is_empty());
    }

    #[test]
    fn unknown_plugin() {
        let config = ConfigurationLoader::default().into_generic();
        match registry().build("mongo", &config) {
            Err(RegistryError::UnknownPlugin { name, known }) => {
                assert_eq!(name, "mongo");
                assert_eq!(known, vec!["broken".to_string(), "null".to_string()]);
            }
            other => panic!("unexpected result: {:?}", other.map(|p| p.name().to_string())),
        }
    }

    #[test]
    fn factory_failure_names_the_plugin() {
        let config = ConfigurationLoader::default().into_generic();
        let err = registry().build_all(&[entry("broken", true)], &config).unwrap_err();
        assert_eq!(err.to_string(), "Failed to build plugin 'broken': missing url");
    }
}
