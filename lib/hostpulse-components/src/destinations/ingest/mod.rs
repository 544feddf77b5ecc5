use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use hostpulse_config::GenericConfiguration;
use hostpulse_core::{
    catalog::TypeCatalog,
    data_model::{Check, CollectableValue},
    plugin::Destination,
};
use hostpulse_error::{generic_error, ErrorContext as _, GenericError};
use hostpulse_io::net::{ReqwestTransport, Transport};
use metrics::{counter, Counter};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::delivery::{json_request, DeliveryBatcher, DeliveryOutcome};

mod encoder;
pub use self::encoder::{IngestElement, IngestEncoder, IngestEvent};

/// Payload size used when the configured size is zero.
const DEFAULT_PAYLOAD_SIZE: usize = 25;

fn default_element_type() -> String {
    "SERVER".to_string()
}

const fn default_payload_size() -> i64 {
    DEFAULT_PAYLOAD_SIZE as i64
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_max_event_title_length() -> usize {
    255
}

const fn default_request_timeout_secs() -> u64 {
    30
}

/// Ingest destination configuration.
///
/// Read from the `ingest` section of the agent configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct IngestConfiguration {
    /// Ingest endpoint URL.
    ///
    /// Events are posted to the same URL with `/ingest/` replaced by `/ingest/events/`.
    pub url: String,

    /// Location reported for every element.
    ///
    /// Defaults to empty.
    #[serde(default)]
    pub location: String,

    /// Element type used for values that do not set their own.
    ///
    /// Defaults to `SERVER`.
    #[serde(default = "default_element_type")]
    pub element_type: String,

    /// Maximum number of metrics and attributes merged into a single element.
    ///
    /// Zero selects the default of 25, and a negative value disables the limit.
    #[serde(default = "default_payload_size")]
    pub payload_size: i64,

    /// Total number of attempts made to deliver a payload that fails with a server error.
    ///
    /// Defaults to 5.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Maximum length of event titles, in characters. Longer titles are truncated.
    ///
    /// Defaults to 255.
    #[serde(default = "default_max_event_title_length")]
    pub max_event_title_length: usize,

    /// Request timeout, in seconds.
    ///
    /// Defaults to 30.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Base URL for checks.
    ///
    /// Defaults to the ingest URL with `/ingest/` replaced by `/check/`.
    #[serde(default)]
    pub check_url: Option<String>,
}

impl IngestConfiguration {
    /// Creates a new `IngestConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the `ingest` section is missing, or cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.get_typed("ingest")?)
    }

    /// Creates a new `IngestConfiguration` for the given URL with default settings.
    pub fn with_url<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            location: String::new(),
            element_type: default_element_type(),
            payload_size: default_payload_size(),
            max_attempts: default_max_attempts(),
            max_event_title_length: default_max_event_title_length(),
            request_timeout_secs: default_request_timeout_secs(),
            check_url: None,
        }
    }

    /// Returns the effective payload size cap.
    pub fn payload_cap(&self) -> usize {
        match self.payload_size {
            0 => DEFAULT_PAYLOAD_SIZE,
            n if n < 0 => usize::MAX,
            n => usize::try_from(n).unwrap_or(usize::MAX),
        }
    }
}

#[derive(Debug)]
struct Endpoints {
    ingest: http::Uri,
    events: http::Uri,
    check_base: String,
}

impl Endpoints {
    fn from_configuration(config: &IngestConfiguration) -> Result<Self, GenericError> {
        if !config.url.contains("/ingest/") {
            warn!(url = %config.url, "Ingest URL has no '/ingest/' segment. Events and checks will be posted to it unchanged.");
        }

        let ingest = config
            .url
            .parse::<http::Uri>()
            .with_error_context(|| format!("Invalid ingest URL '{}'.", config.url))?;
        if ingest.scheme().is_none() || ingest.host().is_none() {
            return Err(generic_error!("Ingest URL '{}' must be absolute.", config.url));
        }

        let events_url = config.url.replacen("/ingest/", "/ingest/events/", 1);
        let events = events_url
            .parse::<http::Uri>()
            .with_error_context(|| format!("Invalid events URL '{}'.", events_url))?;

        let check_base = match &config.check_url {
            Some(check_url) => check_url.clone(),
            None => config.url.replacen("/ingest/", "/check/", 1),
        };

        Ok(Self {
            ingest,
            events,
            check_base: check_base.trim_end_matches('/').to_string(),
        })
    }

    fn check(&self, check: &Check) -> Result<http::Uri, GenericError> {
        let url = format!(
            "{}/{}/{}/{}",
            self.check_base, check.name, check.meta.host, check.check_interval
        );
        url.parse::<http::Uri>()
            .with_error_context(|| format!("Invalid check URL '{}'.", url))
    }
}

struct Telemetry {
    delivered: Counter,
    dropped: Counter,
    skipped: Counter,
}

impl Telemetry {
    fn new() -> Self {
        Self {
            delivered: counter!("ingest_payloads_total", "outcome" => "delivered"),
            dropped: counter!("ingest_payloads_total", "outcome" => "dropped"),
            skipped: counter!("ingest_payloads_total", "outcome" => "disabled"),
        }
    }

    fn record(&self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.delivered.increment(1),
            DeliveryOutcome::Dropped => self.dropped.increment(1),
            DeliveryOutcome::Disabled => self.skipped.increment(1),
        }
    }
}

/// Ingest destination.
///
/// Encodes metrics, attributes, relations, and tags as elements, and posts each merged element on its own. Events are
/// posted together, and each check is refreshed with an empty-bodied `POST`.
pub struct IngestDestination {
    config: IngestConfiguration,
    catalog: Arc<TypeCatalog>,
    endpoints: Endpoints,
    batcher: DeliveryBatcher,
    telemetry: Telemetry,
}

impl IngestDestination {
    /// Creates a new `IngestDestination` that sends through the given transport.
    ///
    /// # Errors
    ///
    /// If the configured URLs are invalid, an error is returned.
    pub fn new(
        config: IngestConfiguration, catalog: Arc<TypeCatalog>, transport: Arc<dyn Transport>,
    ) -> Result<Self, GenericError> {
        let endpoints = Endpoints::from_configuration(&config)?;
        let batcher = DeliveryBatcher::new(transport, config.max_attempts);

        Ok(Self {
            config,
            catalog,
            endpoints,
            batcher,
            telemetry: Telemetry::new(),
        })
    }

    /// Creates a new `IngestDestination` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the `ingest` section is missing or invalid, or the HTTP client cannot be built, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration, catalog: Arc<TypeCatalog>) -> Result<Self, GenericError> {
        let ingest_config = IngestConfiguration::from_configuration(config)?;
        let transport = ReqwestTransport::new(Duration::from_secs(ingest_config.request_timeout_secs))?;
        Self::new(ingest_config, catalog, Arc::new(transport))
    }

    fn encoder(&self) -> IngestEncoder<'_> {
        IngestEncoder::new(&self.catalog, &self.config.element_type, &self.config.location)
            .with_payload_size(self.config.payload_cap())
            .with_max_event_title_length(self.config.max_event_title_length)
    }

    /// Sends a request, returning `false` if delivery has been disabled.
    async fn send(&self, request: Result<http::Request<Bytes>, GenericError>) -> bool {
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Failed to build ingest request. Skipping.");
                return true;
            }
        };

        let outcome = self.batcher.deliver(request).await;
        self.telemetry.record(outcome);
        outcome != DeliveryOutcome::Disabled
    }

    async fn write_elements(&self, values: &[CollectableValue]) -> bool {
        let encoder = self.encoder();
        let elements = encoder.merge_elements(encoder.encode_elements(values));

        debug!(elements = elements.len(), "Posting ingest elements.");
        for element in elements {
            let request = serde_json::to_vec(&[element])
                .error_context("Failed to serialize ingest element.")
                .and_then(|body| Ok(json_request(&self.endpoints.ingest, body)?));
            if !self.send(request).await {
                return false;
            }
        }
        true
    }

    async fn write_events(&self, values: &[CollectableValue]) -> bool {
        let events = self.encoder().encode_events(values);
        if events.is_empty() {
            return true;
        }

        debug!(events = events.len(), "Posting ingest events.");
        let request = serde_json::to_vec(&events)
            .error_context("Failed to serialize ingest events.")
            .and_then(|body| Ok(json_request(&self.endpoints.events, body)?));
        self.send(request).await
    }

    async fn write_checks(&self, values: &[CollectableValue]) {
        for value in values {
            let CollectableValue::Check(check) = value else {
                continue;
            };

            let request = self
                .endpoints
                .check(check)
                .and_then(|uri| Ok(http::Request::post(uri).body(Bytes::new())?));
            if !self.send(request).await {
                return;
            }
        }
    }
}

#[async_trait]
impl Destination for IngestDestination {
    fn name(&self) -> &str {
        "ingest"
    }

    async fn configure(&self) -> Result<(), GenericError> {
        self.batcher.reset();
        info!(
            url = %hostpulse_io::net::retry::SanitizedRequestUri(&self.endpoints.ingest),
            element_type = %self.config.element_type,
            payload_size = self.config.payload_cap(),
            "Ingest destination configured."
        );
        Ok(())
    }

    async fn write(&self, values: &[CollectableValue]) {
        if self.batcher.is_disabled() {
            debug!(values = values.len(), "Ingest destination is disabled. Discarding values.");
            return;
        }

        if self.write_elements(values).await && self.write_events(values).await {
            self.write_checks(values).await;
        }
    }
}
