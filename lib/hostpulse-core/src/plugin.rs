//! Plugin contracts.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use hostpulse_error::{ErrorContext as _, GenericError};

use crate::data_model::CollectableValue;

/// A source of collectable values.
///
/// Sources are polled by the reader loop once per interval. Sources that receive data on their own schedule (such as
/// the statsd listener) buffer it internally and hand it over on `read`.
#[async_trait]
pub trait Source: Send + Sync {
    /// Returns the name of the source, for logging.
    fn name(&self) -> &str;

    /// Prepares the source for starting.
    ///
    /// Called once before `start`, and again whenever the plugin set is reconfigured.
    ///
    /// # Errors
    ///
    /// If the source cannot be configured, an error is returned and the pipeline does not start.
    async fn configure(&self) -> Result<(), GenericError> {
        Ok(())
    }

    /// Starts any background work the source needs.
    ///
    /// # Errors
    ///
    /// If the source cannot be started, an error is returned and the pipeline does not start.
    async fn start(&self) -> Result<(), GenericError> {
        Ok(())
    }

    /// Stops any background work started by `start`.
    async fn stop(&self) {}

    /// Collects the values available since the previous read.
    ///
    /// # Errors
    ///
    /// If collection fails, an error is returned. The reader loop logs it, skips the source for this cycle, and backs
    /// off for a full interval.
    async fn read(&self) -> Result<Vec<CollectableValue>, GenericError>;
}

/// A destination for collectable values.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Returns the name of the destination, for logging.
    fn name(&self) -> &str;

    /// Prepares the destination for starting.
    ///
    /// Also resets any state from a previous run, such as a destination that disabled itself after being told to stop
    /// sending.
    ///
    /// # Errors
    ///
    /// If the destination cannot be configured, an error is returned and the pipeline does not start.
    async fn configure(&self) -> Result<(), GenericError> {
        Ok(())
    }

    /// Starts the destination.
    ///
    /// # Errors
    ///
    /// If the destination cannot be started, an error is returned and the pipeline does not start.
    async fn start(&self) -> Result<(), GenericError> {
        Ok(())
    }

    /// Stops the destination.
    async fn stop(&self) {}

    /// Delivers a batch of values.
    ///
    /// Delivery failures are handled, and logged, by the destination itself: the writer loop always moves on to the
    /// next destination.
    async fn write(&self, values: &[CollectableValue]);
}

/// An instantiated plugin.
#[derive(Clone)]
pub enum Plugin {
    /// A source.
    Source(Arc<dyn Source>),

    /// A destination.
    Destination(Arc<dyn Destination>),
}

impl Plugin {
    /// Returns the name of the plugin.
    pub fn name(&self) -> &str {
        match self {
            Self::Source(source) => source.name(),
            Self::Destination(destination) => destination.name(),
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(source) => f.debug_tuple("Source").field(&source.name()).finish(),
            Self::Destination(destination) => f.debug_tuple("Destination").field(&destination.name()).finish(),
        }
    }
}

/// An ordered, immutable set of plugins.
///
/// Destinations are written to in the order they were added.
#[derive(Clone, Debug, Default)]
pub struct PluginSet {
    sources: Vec<Arc<dyn Source>>,
    destinations: Vec<Arc<dyn Destination>>,
}

impl PluginSet {
    /// Adds a plugin to the set.
    pub fn add(&mut self, plugin: Plugin) {
        match plugin {
            Plugin::Source(source) => self.sources.push(source),
            Plugin::Destination(destination) => self.destinations.push(destination),
        }
    }

    /// Adds a source to the set.
    pub fn with_source(mut self, source: Arc<dyn Source>) -> Self {
        self.sources.push(source);
        self
    }

    /// Adds a destination to the set.
    pub fn with_destination(mut self, destination: Arc<dyn Destination>) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Returns the sources in this set.
    pub fn sources(&self) -> &[Arc<dyn Source>] {
        &self.sources
    }

    /// Returns the destinations in this set, in write order.
    pub fn destinations(&self) -> &[Arc<dyn Destination>] {
        &self.destinations
    }

    /// Configures every plugin, sources first.
    ///
    /// # Errors
    ///
    /// If any plugin fails to configure, an error is returned and the remaining plugins are not configured.
    pub async fn configure_all(&self) -> Result<(), GenericError> {
        for source in &self.sources {
            source
                .configure()
                .await
                .with_error_context(|| format!("Failed to configure source '{}'.", source.name()))?;
        }
        for destination in &self.destinations {
            destination
                .configure()
                .await
                .with_error_context(|| format!("Failed to configure destination '{}'.", destination.name()))?;
        }
        Ok(())
    }

    /// Starts every plugin, destinations first so that nothing is read before it can be written.
    ///
    /// # Errors
    ///
    /// If any plugin fails to start, an error is returned and the remaining plugins are not started.
    pub async fn start_all(&self) -> Result<(), GenericError> {
        for destination in &self.destinations {
            destination
                .start()
                .await
                .with_error_context(|| format!("Failed to start destination '{}'.", destination.name()))?;
        }
        self.start_sources().await
    }

    /// Starts every source.
    ///
    /// # Errors
    ///
    /// If any source fails to start, an error is returned and the remaining sources are not started.
    pub async fn start_sources(&self) -> Result<(), GenericError> {
        for source in &self.sources {
            source
                .start()
                .await
                .with_error_context(|| format!("Failed to start source '{}'.", source.name()))?;
        }
        Ok(())
    }

    /// Stops every plugin, sources first.
    pub async fn stop_all(&self) {
        self.stop_sources().await;
        self.stop_destinations().await;
    }

    /// Stops every source.
    pub async fn stop_sources(&self) {
        for source in &self.sources {
            source.stop().await;
        }
    }

    /// Stops every destination.
    pub async fn stop_destinations(&self) {
        for destination in &self.destinations {
            destination.stop().await;
        }
    }
}

impl fmt::Debug for dyn Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").field("name", &self.name()).finish()
    }
}

impl fmt::Debug for dyn Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination").field("name", &self.name()).finish()
    }
}
