use std::{path::PathBuf, sync::Arc, time::Duration};

use hostpulse_config::GenericConfiguration;
use hostpulse_error::GenericError;
use serde::Deserialize;

use crate::catalog::TypeCatalog;

/// Shortest allowed collection interval, in seconds.
const MINIMUM_INTERVAL_SECS: u64 = 10;

const fn default_interval_secs() -> u64 {
    MINIMUM_INTERVAL_SECS
}

const fn default_max_queue_size() -> usize {
    30_000
}

const fn default_writer_warmup_secs() -> u64 {
    15
}

/// Pipeline configuration.
///
/// Read from the top level of the agent configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct PipelineConfiguration {
    /// Collection interval, in seconds.
    ///
    /// Values below 10 are raised to 10. Defaults to 10.
    #[serde(rename = "interval", default = "default_interval_secs")]
    interval_secs: u64,

    /// Rate entry expiry timeout, in seconds.
    ///
    /// Raised to three times the interval if it is not longer than the interval. Defaults to three times the interval.
    #[serde(rename = "timeout", default)]
    timeout_secs: u64,

    /// Whether counter-like values are converted to per-second rates.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    store_rates: bool,

    /// Maximum number of values held between the reader and writer loops.
    ///
    /// Defaults to 30000.
    #[serde(default = "default_max_queue_size")]
    max_queue_size: usize,

    /// Delay before the writer loop's first cycle, in seconds.
    ///
    /// Gives the reader loop a head start so that values are not always written a full interval after being read.
    /// Defaults to 15.
    #[serde(default = "default_writer_warmup_secs")]
    writer_warmup_secs: u64,

    /// Path to a `types.db` file whose types are added to the built-in ones.
    #[serde(default)]
    types_db: Option<PathBuf>,
}

impl PipelineConfiguration {
    /// Creates a new `PipelineConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let pipeline_config = config.as_typed::<Self>()?;
        Ok(pipeline_config.normalized())
    }

    /// Creates a new `PipelineConfiguration` with default settings.
    pub fn with_defaults() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            timeout_secs: 0,
            store_rates: false,
            max_queue_size: default_max_queue_size(),
            writer_warmup_secs: default_writer_warmup_secs(),
            types_db: None,
        }
        .normalized()
    }

    fn normalized(mut self) -> Self {
        self.interval_secs = self.interval_secs.max(MINIMUM_INTERVAL_SECS);
        if self.timeout_secs <= self.interval_secs {
            self.timeout_secs = self.interval_secs * 3;
        }
        self
    }

    /// Sets whether counter-like values are converted to rates.
    pub fn with_store_rates(mut self, store_rates: bool) -> Self {
        self.store_rates = store_rates;
        self
    }

    /// Sets the maximum queue size.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Sets the writer warm-up delay.
    pub fn with_writer_warmup(mut self, warmup: Duration) -> Self {
        self.writer_warmup_secs = warmup.as_secs();
        self
    }

    /// Returns the collection interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Returns the rate entry expiry timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns whether counter-like values are converted to rates.
    pub fn store_rates(&self) -> bool {
        self.store_rates
    }

    /// Returns the maximum queue size.
    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Returns the writer warm-up delay.
    pub fn writer_warmup(&self) -> Duration {
        Duration::from_secs(self.writer_warmup_secs)
    }

    /// Builds the type catalog: the built-in types, plus those from `types_db` if configured.
    ///
    /// # Errors
    ///
    /// If `types_db` is set but cannot be read, an error is returned.
    pub fn load_catalog(&self) -> Result<Arc<TypeCatalog>, GenericError> {
        let catalog = match &self.types_db {
            Some(path) => TypeCatalog::from_types_db(path)?,
            None => TypeCatalog::builtin(),
        };
        Ok(Arc::new(catalog))
    }
}

#[cfg(test)]
mod tests {
    use hostpulse_config::ConfigurationLoader;

    use super::*;

    fn from_values<T: serde::Serialize>(values: T) -> PipelineConfiguration {
        let config = ConfigurationLoader::default().with_values(values).into_generic();
        PipelineConfiguration::from_configuration(&config).unwrap()
    }

    #[test]
    fn defaults() {
        let config = PipelineConfiguration::from_configuration(&ConfigurationLoader::default().into_generic()).unwrap();
        assert_eq!(config.interval(), Duration::from_secs(10));
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(!config.store_rates());
        assert_eq!(config.max_queue_size(), 30_000);
        assert_eq!(config.writer_warmup(), Duration::from_secs(15));
    }

    #[test]
    fn interval_floor() {
        let config = from_values(serde_json::json!({ "interval": 2 }));
        assert_eq!(config.interval(), Duration::from_secs(10));
    }

    #[test]
    fn short_timeout_is_raised() {
        let config = from_values(serde_json::json!({ "interval": 20, "timeout": 20 }));
        assert_eq!(config.timeout(), Duration::from_secs(60));

        let config = from_values(serde_json::json!({ "interval": 20, "timeout": 45 }));
        assert_eq!(config.timeout(), Duration::from_secs(45));
    }
}
