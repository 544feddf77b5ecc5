use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use hostpulse_config::GenericConfiguration;
use hostpulse_core::{
    catalog::TypeCatalog,
    data_model::{CollectableValue, Metric},
    plugin::Destination,
};
use hostpulse_error::{generic_error, ErrorContext as _, GenericError};
use hostpulse_io::net::{retry::SanitizedRequestUri, ReqwestTransport, Transport};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::delivery::{json_request, DeliveryBatcher};

const fn default_max_attempts() -> u32 {
    1
}

const fn default_request_timeout_secs() -> u64 {
    30
}

/// HTTP destination configuration.
///
/// Read from the `write_http` section of the agent configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct HttpConfiguration {
    /// URL that metrics are posted to.
    pub url: String,

    /// Total number of attempts made to deliver a metric that fails with a server error.
    ///
    /// Defaults to 1, so failed posts are not retried.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Request timeout, in seconds.
    ///
    /// Defaults to 30.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl HttpConfiguration {
    /// Creates a new `HttpConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the `write_http` section is missing, or cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.get_typed("write_http")?)
    }
}

#[derive(Debug, Serialize)]
struct MetricPayload<'a> {
    host: &'a str,
    plugin: &'a str,
    plugin_instance: &'a str,
    #[serde(rename = "type")]
    type_name: &'a str,
    type_instance: &'a str,
    time: f64,
    interval: u64,
    dstypes: Vec<&'static str>,
    dsnames: Vec<&'a str>,
    values: &'a [f64],
}

/// HTTP destination.
///
/// Posts every metric on its own, as a single-element JSON array in the collectd `write_http` format. Other values are
/// ignored.
pub struct HttpDestination {
    uri: http::Uri,
    catalog: Arc<TypeCatalog>,
    batcher: DeliveryBatcher,
}

impl HttpDestination {
    /// Creates a new `HttpDestination` that sends through the given transport.
    ///
    /// # Errors
    ///
    /// If the configured URL is invalid, an error is returned.
    pub fn new(
        config: HttpConfiguration, catalog: Arc<TypeCatalog>, transport: Arc<dyn Transport>,
    ) -> Result<Self, GenericError> {
        let uri = config
            .url
            .parse::<http::Uri>()
            .with_error_context(|| format!("Invalid write_http URL '{}'.", config.url))?;
        if uri.scheme().is_none() || uri.host().is_none() {
            return Err(generic_error!("write_http URL '{}' must be absolute.", config.url));
        }

        Ok(Self {
            uri,
            catalog,
            batcher: DeliveryBatcher::new(transport, config.max_attempts),
        })
    }

    /// Creates a new `HttpDestination` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the `write_http` section is missing or invalid, or the HTTP client cannot be built, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration, catalog: Arc<TypeCatalog>) -> Result<Self, GenericError> {
        let http_config = HttpConfiguration::from_configuration(config)?;
        let transport = ReqwestTransport::new(Duration::from_secs(http_config.request_timeout_secs))?;
        Self::new(http_config, catalog, Arc::new(transport))
    }

    fn payload<'a>(&'a self, metric: &'a Metric) -> MetricPayload<'a> {
        let meta = &metric.meta;
        let (dstypes, dsnames): (Vec<&'static str>, Vec<&str>) = match self.catalog.get(&meta.type_name) {
            Some(sources) => sources.iter().map(|ds| (ds.kind.as_str(), ds.name.as_str())).unzip(),
            None => {
                debug!(type_name = %meta.type_name, "Metric type not found in type catalog.");
                (Vec::new(), Vec::new())
            }
        };

        MetricPayload {
            host: &meta.host,
            plugin: &meta.plugin,
            plugin_instance: &meta.plugin_instance,
            type_name: &meta.type_name,
            type_instance: &meta.type_instance,
            time: meta.timestamp,
            interval: meta.interval,
            dstypes,
            dsnames,
            values: &metric.values,
        }
    }
}

#[async_trait]
impl Destination for HttpDestination {
    fn name(&self) -> &str {
        "write_http"
    }

    async fn configure(&self) -> Result<(), GenericError> {
        self.batcher.reset();
        info!(url = %SanitizedRequestUri(&self.uri), "HTTP destination configured.");
        Ok(())
    }

    async fn write(&self, values: &[CollectableValue]) {
        for value in values {
            let CollectableValue::Metric(metric) = value else {
                continue;
            };

            let request = match serde_json::to_vec(&[self.payload(metric)]) {
                Ok(body) => json_request(&self.uri, body),
                Err(e) => {
                    error!(error = %e, "Failed to serialize metric. Skipping.");
                    continue;
                }
            };
            match request {
                Ok(request) => {
                    self.batcher.deliver(request).await;
                }
                Err(e) => error!(error = %e, "Failed to build HTTP request. Skipping."),
            }

            if self.batcher.is_disabled() {
                debug!("HTTP destination is disabled. Discarding remaining values.");
                return;
            }
        }
    }
}
