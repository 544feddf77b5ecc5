//! Plugin implementations.
//!
//! This crate contains the sources and destinations that ship with the agent, and registers them under their
//! configuration names.

#![deny(missing_docs)]

use std::sync::Arc;

use hostpulse_config::GenericConfiguration;
use hostpulse_core::{catalog::TypeCatalog, plugin::Plugin, registry::PluginRegistry};
use hostpulse_error::GenericError;

pub mod destinations;
pub mod sources;

use self::{
    destinations::{HttpDestination, IngestDestination},
    sources::StatsdSource,
};

/// Registers every built-in plugin.
///
/// | name         | kind        | configuration section |
/// |--------------|-------------|-----------------------|
/// | `statsd`     | source      | `statsd`              |
/// | `ingest`     | destination | `ingest`              |
/// | `write_http` | destination | `write_http`          |
pub fn register_builtin_plugins(registry: &mut PluginRegistry, catalog: Arc<TypeCatalog>) {
    registry.register("statsd", |config| {
        Ok(Plugin::Source(Arc::new(StatsdSource::from_configuration(config)?)))
    });

    let ingest_catalog = Arc::clone(&catalog);
    registry.register("ingest", move |config| {
        let destination = IngestDestination::from_configuration(config, Arc::clone(&ingest_catalog))?;
        Ok(Plugin::Destination(Arc::new(destination)))
    });

    registry.register("write_http", move |config| {
        let destination = HttpDestination::from_configuration(config, Arc::clone(&catalog))?;
        Ok(Plugin::Destination(Arc::new(destination)))
    });
}

/// Returns the hostname values are reported under.
///
/// Uses the top-level `hostname` setting if present, then the `HOSTNAME` environment variable, then `localhost`.
fn configured_hostname(config: &GenericConfiguration) -> Result<String, GenericError> {
    match config.try_get_typed::<String>("hostname")? {
        Some(hostname) if !hostname.is_empty() => Ok(hostname),
        _ => Ok(std::env::var("HOSTNAME")
            .ok()
            .filter(|hostname| !hostname.is_empty())
            .unwrap_or_else(|| "localhost".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use hostpulse_config::ConfigurationLoader;
    use hostpulse_core::registry::{PluginEntry, RegistryError};

    use super::*;

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::default();
        register_builtin_plugins(&mut registry, Arc::new(TypeCatalog::builtin()));
        registry
    }

    fn entry(name: &str) -> PluginEntry {
        PluginEntry {
            name: name.to_string(),
            enabled: true,
        }
    }

    #[test]
    fn builtin_plugins_are_registered() {
        let registry = registry();
        for name in ["statsd", "ingest", "write_http"] {
            assert!(registry.contains(name), "missing plugin '{}'", name);
        }
    }

    #[test]
    fn builds_configured_plugins() {
        let config = ConfigurationLoader::default()
            .with_values(serde_json::json!({
                "hostname": "web-01",
                "ingest": { "url": "https://api.example.com/ingest/KEY" },
                "write_http": { "url": "http://localhost:8080/metrics" },
            }))
            .into_generic();

        let plugins = registry()
            .build_all(&[entry("statsd"), entry("ingest"), entry("write_http")], &config)
            .unwrap();
        assert_eq!(plugins.sources().len(), 1);
        let names = plugins.destinations().iter().map(|d| d.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["ingest", "write_http"]);
    }

    #[test]
    fn missing_destination_url_fails_the_build() {
        let config = ConfigurationLoader::default().into_generic();
        let result = registry().build_all(&[entry("ingest")], &config);
        assert!(matches!(result, Err(RegistryError::FailedToBuild { .. })));
    }

    #[test]
    fn hostname_comes_from_configuration() {
        let config = ConfigurationLoader::default()
            .with_values(serde_json::json!({ "hostname": "db-07" }))
            .into_generic();
        assert_eq!(configured_hostname(&config).unwrap(), "db-07");

        let fallback = configured_hostname(&ConfigurationLoader::default().into_generic()).unwrap();
        assert!(!fallback.is_empty());
    }
}
