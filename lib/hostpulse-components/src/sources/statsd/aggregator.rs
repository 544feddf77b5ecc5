use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use hostpulse_core::data_model::{now_seconds, CollectableValue, Metric, ValueMeta};
use hostpulse_io::codec::statsd::{StatsdSample, StatsdValue};

use super::StatsdConfiguration;

const PLUGIN_NAME: &str = "statsd";

#[derive(Default)]
struct Tables {
    counters: BTreeMap<String, f64>,
    gauges: BTreeMap<String, f64>,
    sets: BTreeMap<String, BTreeSet<String>>,
    timers: BTreeMap<String, Vec<f64>>,
}

/// Accumulates statsd samples between reads.
///
/// All four tables live behind a single lock, and `read` snapshots them under that lock, so every sample is reported
/// by exactly one read (or by every read, for tables that are not cleared on read).
pub struct StatsdAggregator {
    hostname: String,
    config: StatsdConfiguration,
    tables: Mutex<Tables>,
}

impl StatsdAggregator {
    /// Creates a new `StatsdAggregator` reporting as `hostname`.
    pub fn new<S: Into<String>>(hostname: S, config: StatsdConfiguration) -> Self {
        Self {
            hostname: hostname.into(),
            config,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Adds a sample.
    ///
    /// Counters are summed, after scaling by the sample rate. Gauges are replaced, unless the wire value carried an
    /// explicit sign, in which case it is added. Set members are deduplicated, and timer samples are appended.
    pub fn add_metric(&self, sample: StatsdSample) {
        let StatsdSample {
            name,
            value,
            sample_rate,
            ..
        } = sample;

        let mut tables = self.tables.lock().unwrap();
        match value {
            StatsdValue::Counter(count) => {
                let count = sample_rate.map_or(count, |rate| count / rate);
                *tables.counters.entry(name).or_default() += count;
            }
            StatsdValue::Gauge { value, relative: true } => *tables.gauges.entry(name).or_default() += value,
            StatsdValue::Gauge { value, relative: false } => {
                tables.gauges.insert(name, value);
            }
            StatsdValue::Set(member) => {
                tables.sets.entry(name).or_default().insert(member);
            }
            StatsdValue::Timer(duration) => tables.timers.entry(name).or_default().push(duration),
        }
    }

    /// Returns the aggregated values, clearing each table configured for delete-on-read.
    pub fn read(&self) -> Vec<CollectableValue> {
        let timestamp = now_seconds();
        let mut values = Vec::new();

        let mut tables = self.tables.lock().unwrap();

        for (name, count) in &tables.counters {
            values.push(self.metric(timestamp, "count", name.clone(), *count));
        }
        for (name, gauge) in &tables.gauges {
            values.push(self.metric(timestamp, "gauge", name.clone(), *gauge));
        }
        for (name, members) in &tables.sets {
            values.push(self.metric(timestamp, "objects", name.clone(), members.len() as f64));
        }
        for (name, samples) in &tables.timers {
            self.read_timer(timestamp, name, samples, &mut values);
        }

        if self.config.delete_counters {
            tables.counters.clear();
        }
        if self.config.delete_gauges {
            tables.gauges.clear();
        }
        if self.config.delete_sets {
            tables.sets.clear();
        }
        if self.config.delete_timers {
            tables.timers.clear();
        }

        values
    }

    fn read_timer(&self, timestamp: f64, name: &str, samples: &[f64], values: &mut Vec<CollectableValue>) {
        if samples.is_empty() {
            return;
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        if self.config.timer_lower {
            values.push(self.metric(timestamp, "latency", format!("{}-lower", name), sorted[0]));
        }
        if self.config.timer_upper {
            values.push(self.metric(timestamp, "latency", format!("{}-upper", name), sorted[sorted.len() - 1]));
        }
        if self.config.timer_sum {
            values.push(self.metric(timestamp, "latency", format!("{}-sum", name), sorted.iter().sum()));
        }
        for percentile in &self.config.percentiles {
            let value = nearest_rank(&sorted, *percentile);
            values.push(self.metric(
                timestamp,
                "latency",
                format!("{}-percentile-{}", name, percentile),
                value,
            ));
        }
        if self.config.timer_count {
            values.push(self.metric(timestamp, "count", format!("{}-count", name), sorted.len() as f64));
        }
    }

    fn metric(&self, timestamp: f64, type_name: &str, type_instance: String, value: f64) -> CollectableValue {
        let meta = ValueMeta::new(self.hostname.as_str(), PLUGIN_NAME)
            .with_type(type_name)
            .with_type_instance(type_instance)
            .with_timestamp(timestamp);
        Metric::single(meta, value).into()
    }
}

/// Returns the nearest-rank percentile of an ascending, non-empty slice.
///
/// The result is the element at 1-based position `ceil(p / 100 * n)`, clamped to the bounds of the slice.
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = (percentile * sorted.len() as f64 / 100.0).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StatsdConfiguration {
        StatsdConfiguration::with_defaults()
    }

    fn sample(name: &str, value: StatsdValue) -> StatsdSample {
        StatsdSample {
            name: name.to_string(),
            value,
            sample_rate: None,
            tags: Vec::new(),
        }
    }

    /// Returns `(type_instance, type, value)` for every metric read.
    fn read(aggregator: &StatsdAggregator) -> Vec<(String, String, f64)> {
        aggregator
            .read()
            .into_iter()
            .map(|value| match value {
                CollectableValue::Metric(metric) => {
                    assert_eq!(metric.meta.plugin, "statsd");
                    assert_eq!(metric.meta.host, "web-01");
                    (metric.meta.type_instance, metric.meta.type_name, metric.values[0])
                }
                other => panic!("unexpected value: {:?}", other),
            })
            .collect()
    }

    fn row(type_instance: &str, type_name: &str, value: f64) -> (String, String, f64) {
        (type_instance.to_string(), type_name.to_string(), value)
    }

    #[test]
    fn counters_sum_and_clear_on_read() {
        let aggregator = StatsdAggregator::new("web-01", config());
        aggregator.add_metric(sample("foo", StatsdValue::Counter(5.0)));
        aggregator.add_metric(sample("foo", StatsdValue::Counter(3.0)));

        assert_eq!(read(&aggregator), vec![row("foo", "count", 8.0)]);
        assert!(read(&aggregator).is_empty());
    }

    #[test]
    fn counters_kept_when_not_deleting() {
        let mut config = config();
        config.delete_counters = false;

        let aggregator = StatsdAggregator::new("web-01", config);
        aggregator.add_metric(sample("foo", StatsdValue::Counter(5.0)));
        aggregator.add_metric(sample("foo", StatsdValue::Counter(3.0)));

        assert_eq!(read(&aggregator), vec![row("foo", "count", 8.0)]);
        assert_eq!(read(&aggregator), vec![row("foo", "count", 8.0)]);

        aggregator.add_metric(sample("foo", StatsdValue::Counter(2.0)));
        assert_eq!(read(&aggregator), vec![row("foo", "count", 10.0)]);
    }

    #[test]
    fn sampled_counters_are_scaled() {
        let aggregator = StatsdAggregator::new("web-01", config());
        let mut sampled = sample("foo", StatsdValue::Counter(1.0));
        sampled.sample_rate = Some(0.25);
        aggregator.add_metric(sampled);

        assert_eq!(read(&aggregator), vec![row("foo", "count", 4.0)]);
    }

    #[test]
    fn gauges_replace_or_adjust() {
        // Gauges are kept across reads by default.
        let aggregator = StatsdAggregator::new("web-01", config());
        aggregator.add_metric(sample("temp", StatsdValue::Gauge { value: 10.0, relative: false }));
        aggregator.add_metric(sample("temp", StatsdValue::Gauge { value: 20.0, relative: false }));
        assert_eq!(read(&aggregator), vec![row("temp", "gauge", 20.0)]);

        aggregator.add_metric(sample("temp", StatsdValue::Gauge { value: -5.0, relative: true }));
        assert_eq!(read(&aggregator), vec![row("temp", "gauge", 15.0)]);
        assert_eq!(read(&aggregator), vec![row("temp", "gauge", 15.0)]);
    }

    #[test]
    fn sets_report_cardinality() {
        let aggregator = StatsdAggregator::new("web-01", config());
        for member in ["alice", "bob", "alice"] {
            aggregator.add_metric(sample("users", StatsdValue::Set(member.to_string())));
        }

        assert_eq!(read(&aggregator), vec![row("users", "objects", 2.0)]);
        assert!(read(&aggregator).is_empty());
    }

    #[test]
    fn timer_percentile_is_nearest_rank() {
        let mut config = config();
        config.percentiles = vec![90.0];

        let aggregator = StatsdAggregator::new("web-01", config);
        // Added out of order to make sure samples are sorted first.
        for value in (1..=100).rev() {
            aggregator.add_metric(sample("req", StatsdValue::Timer(value as f64)));
        }

        assert_eq!(read(&aggregator), vec![row("req-percentile-90", "latency", 90.0)]);
    }

    #[test]
    fn timer_summaries() {
        let mut config = config();
        config.timer_lower = true;
        config.timer_upper = true;
        config.timer_sum = true;
        config.timer_count = true;

        let aggregator = StatsdAggregator::new("web-01", config);
        for value in [30.0, 10.0, 20.0] {
            aggregator.add_metric(sample("req", StatsdValue::Timer(value)));
        }

        assert_eq!(
            read(&aggregator),
            vec![
                row("req-lower", "latency", 10.0),
                row("req-upper", "latency", 30.0),
                row("req-sum", "latency", 60.0),
                row("req-count", "count", 3.0),
            ]
        );
        assert!(read(&aggregator).is_empty());
    }

    #[test]
    fn nearest_rank_bounds() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(nearest_rank(&sorted, 0.0), 1.0);
        assert_eq!(nearest_rank(&sorted, 50.0), 2.0);
        assert_eq!(nearest_rank(&sorted, 51.0), 3.0);
        assert_eq!(nearest_rank(&sorted, 100.0), 4.0);
        assert_eq!(nearest_rank(&[7.0], 99.9), 7.0);
    }

    #[test]
    fn nearest_rank_is_exact_for_whole_percentiles() {
        let sorted = (1..=100).map(f64::from).collect::<Vec<_>>();
        for p in 1..=100 {
            assert_eq!(nearest_rank(&sorted, f64::from(p)), f64::from(p), "p{}", p);
        }

        // 7% of 200 samples is exactly rank 14.
        let sorted = (1..=200).map(f64::from).collect::<Vec<_>>();
        assert_eq!(nearest_rank(&sorted, 7.0), 14.0);
    }
}
