use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use hostpulse_config::GenericConfiguration;
use hostpulse_core::{data_model::CollectableValue, plugin::Source};
use hostpulse_error::{generic_error, GenericError};
use hostpulse_io::codec::statsd::parse_statsd_packet;
use metrics::{counter, Counter};
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tokio::{net::UdpSocket, select, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

mod aggregator;
pub use self::aggregator::StatsdAggregator;

use crate::configured_hostname;

/// Largest UDP payload we can receive.
const MAX_DATAGRAM_SIZE: usize = 65_535;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
enum Error {
    #[snafu(display("Failed to bind statsd listener to {}.", address))]
    Bind { address: SocketAddr, source: io::Error },
}

const fn default_port() -> u16 {
    8125
}

const fn default_true() -> bool {
    true
}

/// Statsd source configuration.
///
/// Read from the `statsd` section of the agent configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct StatsdConfiguration {
    /// UDP port to listen on.
    ///
    /// Defaults to 8125.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Whether counters are cleared after each read.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_true")]
    pub delete_counters: bool,

    /// Whether timer samples are cleared after each read.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_true")]
    pub delete_timers: bool,

    /// Whether gauges are cleared after each read.
    ///
    /// Defaults to `false`, so a gauge keeps reporting its last value until it is updated.
    #[serde(default)]
    pub delete_gauges: bool,

    /// Whether set members are cleared after each read.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_true")]
    pub delete_sets: bool,

    /// Whether the smallest sample of each timer is reported.
    #[serde(default)]
    pub timer_lower: bool,

    /// Whether the largest sample of each timer is reported.
    #[serde(default)]
    pub timer_upper: bool,

    /// Whether the sum of each timer's samples is reported.
    #[serde(default)]
    pub timer_sum: bool,

    /// Whether the number of samples of each timer is reported.
    #[serde(default)]
    pub timer_count: bool,

    /// Percentiles reported for each timer, each in `(0, 100]`.
    #[serde(default)]
    pub percentiles: Vec<f64>,
}

impl StatsdConfiguration {
    /// Creates a new `StatsdConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the `statsd` section cannot be deserialized, or lists a percentile outside of `(0, 100]`, an error is
    /// returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let statsd_config = config
            .try_get_typed::<Self>("statsd")?
            .unwrap_or_else(Self::with_defaults);

        if let Some(percentile) = statsd_config
            .percentiles
            .iter()
            .find(|p| !(**p > 0.0 && **p <= 100.0))
        {
            return Err(generic_error!(
                "Invalid statsd percentile {}: must be greater than 0 and at most 100.",
                percentile
            ));
        }

        Ok(statsd_config)
    }

    /// Creates a new `StatsdConfiguration` with default settings.
    pub fn with_defaults() -> Self {
        Self {
            port: default_port(),
            delete_counters: true,
            delete_timers: true,
            delete_gauges: false,
            delete_sets: true,
            timer_lower: false,
            timer_upper: false,
            timer_sum: false,
            timer_count: false,
            percentiles: Vec::new(),
        }
    }
}

struct Listener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Statsd source.
///
/// Listens for statsd datagrams over UDP while started, aggregating them until the next read.
pub struct StatsdSource {
    port: u16,
    aggregator: Arc<StatsdAggregator>,
    listener: Mutex<Option<Listener>>,
    malformed_lines: Counter,
}

impl StatsdSource {
    /// Creates a new `StatsdSource` reporting as `hostname`.
    pub fn new<S: Into<String>>(hostname: S, config: StatsdConfiguration) -> Self {
        Self {
            port: config.port,
            aggregator: Arc::new(StatsdAggregator::new(hostname, config)),
            listener: Mutex::new(None),
            malformed_lines: counter!("statsd_malformed_lines_total"),
        }
    }

    /// Creates a new `StatsdSource` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let hostname = configured_hostname(config)?;
        let statsd_config = StatsdConfiguration::from_configuration(config)?;
        Ok(Self::new(hostname, statsd_config))
    }

    /// Returns the address the listener is bound to, if it is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().unwrap().as_ref().map(|listener| listener.local_addr)
    }
}

#[async_trait]
impl Source for StatsdSource {
    fn name(&self) -> &str {
        "statsd"
    }

    async fn start(&self) -> Result<(), GenericError> {
        if self.listener.lock().unwrap().is_some() {
            return Ok(());
        }

        let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let socket = UdpSocket::bind(address).await.context(Bind { address })?;
        let local_addr = socket.local_addr().context(Bind { address })?;

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_listener(
            socket,
            Arc::clone(&self.aggregator),
            self.malformed_lines.clone(),
            shutdown.clone(),
        ));

        info!(%local_addr, "Statsd listener started.");

        *self.listener.lock().unwrap() = Some(Listener {
            local_addr,
            shutdown,
            task,
        });
        Ok(())
    }

    async fn stop(&self) {
        let listener = self.listener.lock().unwrap().take();
        if let Some(listener) = listener {
            listener.shutdown.cancel();
            if let Err(e) = listener.task.await {
                error!(error = %e, "Statsd listener task failed.");
            }
            info!(local_addr = %listener.local_addr, "Statsd listener stopped.");
        }
    }

    async fn read(&self) -> Result<Vec<CollectableValue>, GenericError> {
        Ok(self.aggregator.read())
    }
}

async fn run_listener(
    socket: UdpSocket, aggregator: Arc<StatsdAggregator>, malformed_lines: Counter, shutdown: CancellationToken,
) {
    let mut buf = vec![0; MAX_DATAGRAM_SIZE];

    loop {
        select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, peer_addr)) => {
                    for parsed in parse_statsd_packet(&buf[..len]) {
                        match parsed {
                            Ok(sample) => aggregator.add_metric(sample),
                            Err(e) => {
                                debug!(%peer_addr, error = %e, "Dropping malformed statsd line.");
                                malformed_lines.increment(1);
                            }
                        }
                    }
                }
                Err(e) => error!(error = %e, "Failed to receive statsd datagram."),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hostpulse_config::ConfigurationLoader;
    use hostpulse_core::{
        catalog::TypeCatalog,
        pipeline::{Pipeline, PipelineConfiguration},
        plugin::PluginSet,
    };

    use super::*;

    fn configuration(values: serde_json::Value) -> GenericConfiguration {
        ConfigurationLoader::default().with_values(values).into_generic()
    }

    #[test]
    fn configuration_defaults() {
        let config = StatsdConfiguration::from_configuration(&configuration(serde_json::json!({}))).unwrap();
        assert_eq!(config.port, 8125);
        assert!(config.delete_counters);
        assert!(config.delete_timers);
        assert!(!config.delete_gauges);
        assert!(config.delete_sets);
        assert!(!config.timer_lower && !config.timer_upper && !config.timer_sum && !config.timer_count);
        assert!(config.percentiles.is_empty());
    }

    #[test]
    fn configuration_from_section() {
        let config = StatsdConfiguration::from_configuration(&configuration(serde_json::json!({
            "statsd": { "port": 9125, "delete_gauges": true, "timer_count": true, "percentiles": [50, 99.5] }
        })))
        .unwrap();
        assert_eq!(config.port, 9125);
        assert!(config.delete_gauges);
        assert!(config.timer_count);
        assert_eq!(config.percentiles, vec![50.0, 99.5]);
    }

    #[test]
    fn invalid_percentile_is_rejected() {
        for percentile in [0.0, -1.0, 100.5] {
            let result = StatsdConfiguration::from_configuration(&configuration(serde_json::json!({
                "statsd": { "percentiles": [percentile] }
            })));
            assert!(result.is_err(), "percentile {} should be rejected", percentile);
        }
    }

    #[tokio::test]
    async fn listener_aggregates_datagrams() {
        let mut config = StatsdConfiguration::with_defaults();
        config.port = 0;

        let source = StatsdSource::new("web-01", config);
        source.start().await.unwrap();
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, source.local_addr().unwrap().port()));

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        client
            .send_to(b"foo:5|c\nnot a metric\nfoo:3|c\n", target)
            .await
            .unwrap();

        let mut total = 0.0;
        for _ in 0..100 {
            for value in source.read().await.unwrap() {
                if let CollectableValue::Metric(metric) = value {
                    assert_eq!(metric.meta.type_instance, "foo");
                    total += metric.values[0];
                }
            }
            if total >= 8.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(total, 8.0);

        source.stop().await;
        assert!(source.local_addr().is_none());
    }

    fn source_on(port: u16) -> Arc<StatsdSource> {
        let mut config = StatsdConfiguration::with_defaults();
        config.port = port;
        Arc::new(StatsdSource::new("web-01", config))
    }

    #[tokio::test]
    async fn bind_failure_names_the_cause_once() {
        let occupied = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let source = source_on(occupied.local_addr().unwrap().port());

        let error = source.start().await.unwrap_err();
        let cause = error.root_cause().to_string();
        let rendered = format!("{:#}", error);

        assert!(rendered.starts_with("Failed to bind statsd listener to 0.0.0.0:"));
        assert_eq!(rendered.matches(cause.as_str()).count(), 1, "{}", rendered);
        assert!(source.local_addr().is_none());
    }

    #[tokio::test]
    async fn reconfigured_pipeline_rebinds_the_same_port() {
        let port = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let first = source_on(port);
        let pipeline = Pipeline::new(
            PipelineConfiguration::with_defaults(),
            Arc::new(TypeCatalog::builtin()),
            PluginSet::default().with_source(Arc::clone(&first) as Arc<dyn Source>),
        );
        pipeline.start_all().await.unwrap();
        assert_eq!(first.local_addr().map(|addr| addr.port()), Some(port));

        let second = source_on(port);
        pipeline
            .reconfigure(PluginSet::default().with_source(Arc::clone(&second) as Arc<dyn Source>))
            .await
            .unwrap();
        assert!(first.local_addr().is_none());
        assert_eq!(second.local_addr().map(|addr| addr.port()), Some(port));

        pipeline.stop_all().await;
        assert!(second.local_addr().is_none());
    }
}
