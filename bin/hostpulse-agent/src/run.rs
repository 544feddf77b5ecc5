use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use hostpulse_components::register_builtin_plugins;
use hostpulse_config::GenericConfiguration;
use hostpulse_core::{
    catalog::TypeCatalog,
    pipeline::{Pipeline, PipelineConfiguration},
    plugin::PluginSet,
    registry::{PluginEntry, PluginRegistry},
};
use hostpulse_error::{ErrorContext as _, GenericError};
use tokio::select;
use tracing::{error, info, warn};

use crate::config::load_configuration;

/// Builds the type catalog and every enabled plugin listed under `plugins`.
///
/// # Errors
///
/// If the pipeline settings are invalid, the `plugins` list is missing, or any plugin fails to build, an error is
/// returned.
pub fn build_plugins(config: &GenericConfiguration) -> Result<(Arc<TypeCatalog>, PluginSet), GenericError> {
    let pipeline_config =
        PipelineConfiguration::from_configuration(config).error_context("Invalid pipeline configuration.")?;
    let catalog = pipeline_config.load_catalog()?;

    let entries = config
        .get_typed::<Vec<PluginEntry>>("plugins")
        .error_context("Invalid plugin list.")?;

    let mut registry = PluginRegistry::default();
    register_builtin_plugins(&mut registry, Arc::clone(&catalog));

    let plugins = registry.build_all(&entries, config)?;
    if plugins.destinations().is_empty() {
        warn!("No destinations are enabled. Collected values will be discarded.");
    }

    Ok((catalog, plugins))
}

/// Runs the pipeline until the process is asked to stop.
///
/// On `SIGHUP`, the configuration file is reloaded and the plugin set is swapped for one built from it. Pipeline
/// settings (interval, queue size, and so on) only take effect on restart.
pub async fn run(config_path: PathBuf, config: GenericConfiguration) -> Result<(), GenericError> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        process_id = std::process::id(),
        "hostpulse starting..."
    );

    let pipeline_config =
        PipelineConfiguration::from_configuration(&config).error_context("Invalid pipeline configuration.")?;
    let (catalog, plugins) = build_plugins(&config)?;

    info!(
        interval = ?pipeline_config.interval(),
        timeout = ?pipeline_config.timeout(),
        store_rates = pipeline_config.store_rates(),
        types = catalog.len(),
        sources = plugins.sources().len(),
        destinations = plugins.destinations().len(),
        "Pipeline configured."
    );

    let pipeline = Pipeline::new(pipeline_config, catalog, plugins);
    pipeline.configure_all().await?;
    pipeline.start_all().await?;

    info!("hostpulse started.");

    let mut reload = reload_signal()?;
    loop {
        select! {
            result = tokio::signal::ctrl_c() => {
                result.error_context("Failed to listen for shutdown signal.")?;
                info!("Received shutdown signal. Stopping...");
                break;
            }
            _ = reload.recv() => {
                info!("Received reload signal. Reloading plugins...");
                if let Err(e) = reload_plugins(&pipeline, &config_path).await {
                    error!(error = ?e, "Failed to reload plugins. Keeping the current plugins.");
                }
            }
        }
    }

    pipeline.stop_all().await;
    Ok(())
}

async fn reload_plugins(pipeline: &Pipeline, config_path: &Path) -> Result<(), GenericError> {
    let config = load_configuration(config_path)?;
    let (_, plugins) = build_plugins(&config)?;
    pipeline.reconfigure(plugins).await?;
    info!("Plugins reloaded.");
    Ok(())
}

#[cfg(unix)]
struct ReloadSignal(tokio::signal::unix::Signal);

#[cfg(unix)]
impl ReloadSignal {
    async fn recv(&mut self) -> Option<()> {
        self.0.recv().await
    }
}

#[cfg(unix)]
fn reload_signal() -> Result<ReloadSignal, GenericError> {
    use tokio::signal::unix::{signal, SignalKind};

    let hangup = signal(SignalKind::hangup()).error_context("Failed to listen for reload signal.")?;
    Ok(ReloadSignal(hangup))
}

#[cfg(not(unix))]
struct ReloadSignal;

#[cfg(not(unix))]
impl ReloadSignal {
    async fn recv(&mut self) -> Option<()> {
        std::future::pending().await
    }
}

#[cfg(not(unix))]
fn reload_signal() -> Result<ReloadSignal, GenericError> {
    Ok(ReloadSignal)
}
