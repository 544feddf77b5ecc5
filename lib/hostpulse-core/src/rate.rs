use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::debug;

use crate::{
    catalog::TypeCatalog,
    data_model::{now_seconds, Metric},
};

struct Observation {
    last_values: Vec<f64>,
    last_timestamp: f64,
}

/// Converts counter samples into per-second rates.
///
/// The most recent raw observation is remembered for every metric identity. When a later observation of the same
/// identity arrives, each rate-eligible component (per the type catalog) is replaced with its change per second since
/// then. Identities that have not been observed for longer than the timeout are forgotten, so their next observation
/// is treated as a first sighting.
pub struct RateAggregator {
    timeout: Duration,
    store_rates: bool,
    catalog: Arc<TypeCatalog>,
    observations: Mutex<HashMap<String, Observation>>,
}

impl RateAggregator {
    /// Creates a new `RateAggregator`.
    pub fn new(timeout: Duration, store_rates: bool, catalog: Arc<TypeCatalog>) -> Self {
        Self {
            timeout,
            store_rates,
            catalog,
            observations: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the expiry timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Records an observation of `metric`, converting its values to rates in place where applicable.
    pub fn aggregate(&self, metric: &mut Metric) {
        let key = metric.meta.identity_key();
        let timestamp = metric.meta.timestamp;
        let raw_values = metric.values.clone();

        let eligible = self.rate_eligible_components(metric);

        let mut observations = self.observations.lock().unwrap();
        if let Some(previous) = observations.get(&key) {
            let dt = timestamp - previous.last_timestamp;
            if dt > 0.0 && previous.last_values.len() == metric.values.len() {
                if let Some(eligible) = &eligible {
                    for (idx, value) in metric.values.iter_mut().enumerate() {
                        if eligible[idx] {
                            *value = (*value - previous.last_values[idx]) / dt;
                        }
                    }
                }
            }
        }

        observations.insert(
            key,
            Observation {
                last_values: raw_values,
                last_timestamp: timestamp,
            },
        );
    }

    /// Returns which components of `metric` should become rates, or `None` if none should.
    fn rate_eligible_components(&self, metric: &Metric) -> Option<Vec<bool>> {
        if !self.store_rates {
            return None;
        }

        let sources = self.catalog.get(&metric.meta.type_name)?;
        if sources.len() != metric.values.len() {
            debug!(
                type_name = %metric.meta.type_name,
                expected = sources.len(),
                actual = metric.values.len(),
                "Metric value count does not match its type. Passing through."
            );
            return None;
        }

        let eligible = sources.iter().map(|ds| ds.kind.is_rate_eligible()).collect::<Vec<_>>();
        eligible.iter().any(|e| *e).then_some(eligible)
    }

    /// Forgets every identity last observed more than `timeout` ago.
    pub fn remove_expired_entries(&self) {
        self.remove_expired_entries_at(now_seconds());
    }

    /// Forgets every identity last observed more than `timeout` before `now`, in seconds since the Unix epoch.
    pub fn remove_expired_entries_at(&self, now: f64) {
        let timeout = self.timeout.as_secs_f64();

        let mut observations = self.observations.lock().unwrap();
        let before = observations.len();
        observations.retain(|_, observation| now - observation.last_timestamp <= timeout);

        let removed = before - observations.len();
        if removed > 0 {
            debug!(removed, remaining = observations.len(), "Removed expired rate entries.");
        }
    }

    /// Returns the number of tracked identities.
    pub fn len(&self) -> usize {
        self.observations.lock().unwrap().len()
    }

    /// Returns `true` if no identities are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::ValueMeta;

    fn aggregator(store_rates: bool) -> RateAggregator {
        RateAggregator::new(Duration::from_secs(30), store_rates, Arc::new(TypeCatalog::builtin()))
    }

    fn sample(type_name: &str, values: Vec<f64>, timestamp: f64) -> Metric {
        let meta = ValueMeta::new("web-01", "interface")
            .with_plugin_instance("eth0")
            .with_type(type_name)
            .with_timestamp(timestamp);
        Metric::new(meta, values)
    }

    #[test]
    fn counter_becomes_rate() {
        let aggregator = aggregator(true);

        let mut first = sample("counter", vec![100.0], 0.0);
        aggregator.aggregate(&mut first);
        assert_eq!(first.values, vec![100.0]);

        let mut second = sample("counter", vec![130.0], 10.0);
        aggregator.aggregate(&mut second);
        assert_eq!(second.values, vec![3.0]);

        // Rates are computed against the previous raw value, not the previous rate.
        let mut third = sample("counter", vec![150.0], 20.0);
        aggregator.aggregate(&mut third);
        assert_eq!(third.values, vec![2.0]);
    }

    #[test]
    fn first_sighting_passes_through() {
        for store_rates in [true, false] {
            let aggregator = aggregator(store_rates);
            let mut metric = sample("counter", vec![100.0], 0.0);
            aggregator.aggregate(&mut metric);

            assert_eq!(metric.values, vec![100.0]);
            assert_eq!(aggregator.len(), 1);
        }
    }

    #[test]
    fn store_rates_off_passes_through() {
        let aggregator = aggregator(false);
        aggregator.aggregate(&mut sample("counter", vec![100.0], 0.0));

        let mut metric = sample("counter", vec![130.0], 10.0);
        aggregator.aggregate(&mut metric);
        assert_eq!(metric.values, vec![130.0]);
    }

    #[test]
    fn gauges_pass_through() {
        let aggregator = aggregator(true);
        aggregator.aggregate(&mut sample("gauge", vec![100.0], 0.0));

        let mut metric = sample("gauge", vec![130.0], 10.0);
        aggregator.aggregate(&mut metric);
        assert_eq!(metric.values, vec![130.0]);
    }

    #[test]
    fn non_increasing_timestamp_passes_through() {
        let aggregator = aggregator(true);
        aggregator.aggregate(&mut sample("counter", vec![100.0], 10.0));

        let mut metric = sample("counter", vec![130.0], 10.0);
        aggregator.aggregate(&mut metric);
        assert_eq!(metric.values, vec![130.0]);

        let mut metric = sample("counter", vec![160.0], 5.0);
        aggregator.aggregate(&mut metric);
        assert_eq!(metric.values, vec![160.0]);
    }

    #[test]
    fn compound_type_rates_each_component() {
        let aggregator = aggregator(true);
        aggregator.aggregate(&mut sample("if_octets", vec![1000.0, 500.0], 0.0));

        let mut metric = sample("if_octets", vec![2000.0, 700.0], 10.0);
        aggregator.aggregate(&mut metric);
        assert_eq!(metric.values, vec![100.0, 20.0]);
    }

    #[test]
    fn mismatched_value_count_passes_through() {
        let aggregator = aggregator(true);
        aggregator.aggregate(&mut sample("if_octets", vec![1000.0], 0.0));

        let mut metric = sample("if_octets", vec![2000.0], 10.0);
        aggregator.aggregate(&mut metric);
        assert_eq!(metric.values, vec![2000.0]);
    }

    #[test]
    fn unknown_type_passes_through() {
        let aggregator = aggregator(true);
        aggregator.aggregate(&mut sample("mystery", vec![1.0], 0.0));

        let mut metric = sample("mystery", vec![5.0], 10.0);
        aggregator.aggregate(&mut metric);
        assert_eq!(metric.values, vec![5.0]);
    }

    #[test]
    fn expired_identity_is_seen_again_for_the_first_time() {
        let aggregator = aggregator(true);
        aggregator.aggregate(&mut sample("counter", vec![100.0], 0.0));

        // Exactly at the timeout is not yet expired.
        aggregator.remove_expired_entries_at(30.0);
        assert_eq!(aggregator.len(), 1);

        aggregator.remove_expired_entries_at(31.0);
        assert!(aggregator.is_empty());

        let mut metric = sample("counter", vec![400.0], 40.0);
        aggregator.aggregate(&mut metric);
        assert_eq!(metric.values, vec![400.0]);
    }
}
