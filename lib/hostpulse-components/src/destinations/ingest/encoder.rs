//! Ingest payload encoding.
//!
//! Metrics, attributes, relations, and tags are grouped into one element per host. Events and checks are delivered
//! separately.

use hostpulse_core::{
    catalog::{DataSourceKind, TypeCatalog},
    data_model::{Attribute, CollectableValue, Event, EventLevel, Metric, Relation, Tag, ValueMeta},
};
use serde::Serialize;
use tracing::warn;

/// A bundle of metrics, attributes, relations, and tags for a single element.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IngestElement {
    /// Element identifier.
    pub id: String,

    /// Element display name.
    pub name: String,

    /// Element type.
    #[serde(rename = "type")]
    pub element_type: String,

    /// Element location.
    pub location: String,

    /// Metric definitions.
    pub metrics: Vec<IngestMetric>,

    /// Metric samples.
    pub samples: Vec<IngestSample>,

    /// Attributes.
    pub attributes: Vec<IngestAttribute>,

    /// Relations.
    pub relations: Vec<IngestRelation>,

    /// Tags.
    pub tags: Vec<IngestTag>,
}

impl IngestElement {
    fn new(id: &str, element_type: &str, location: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            element_type: element_type.to_string(),
            location: location.to_string(),
            metrics: Vec::new(),
            samples: Vec::new(),
            attributes: Vec::new(),
            relations: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// Returns the size of this element for batching purposes: its metric count plus its attribute count.
    pub fn payload_size(&self) -> usize {
        self.metrics.len() + self.attributes.len()
    }

    fn merge(&mut self, other: IngestElement) {
        self.metrics.extend(other.metrics);
        self.samples.extend(other.samples);
        self.attributes.extend(other.attributes);
        self.relations.extend(other.relations);
        self.tags.extend(other.tags);
    }
}

/// A metric definition.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IngestMetric {
    /// Metric identifier.
    pub id: String,

    /// Unit, which is the metric's type name.
    pub unit: String,

    /// Display name.
    pub name: String,

    /// `COUNTER` for counter data sources, otherwise omitted.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<&'static str>,
}

/// A metric sample.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IngestSample {
    /// Identifier of the metric this sample belongs to.
    #[serde(rename = "metricId")]
    pub metric_id: String,

    /// Sample time, in milliseconds since the Unix epoch.
    pub timestamp: i64,

    /// Sample value.
    pub val: f64,
}

/// An element attribute.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IngestAttribute {
    /// Attribute name.
    pub name: String,

    /// Attribute value.
    pub value: String,
}

/// A relation to another element.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IngestRelation {
    /// Fully-qualified name of the related element.
    pub fqn: String,
}

/// An element tag.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IngestTag {
    /// Tag name.
    pub name: String,

    /// Tag value.
    pub value: String,
}

/// An event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IngestEvent {
    /// Event type. Always `INFO`; severity is carried in `data.level`.
    #[serde(rename = "type")]
    pub event_type: &'static str,

    /// Name of the agent component that produced the event.
    pub source: String,

    /// Event details.
    pub data: IngestEventData,

    /// Event title.
    pub title: String,

    /// Event time, in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Event details.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IngestEventData {
    /// Identifier of the element the event belongs to.
    #[serde(rename = "elementId")]
    pub element_id: String,

    /// Severity: `CRITICAL`, `WARNING`, or `INFO`.
    pub level: &'static str,

    /// Event message.
    pub message: String,
}

/// Builds ingest payloads from collectable values.
pub struct IngestEncoder<'a> {
    catalog: &'a TypeCatalog,
    default_element_type: &'a str,
    location: &'a str,
    payload_size: usize,
    max_event_title_length: usize,
}

impl<'a> IngestEncoder<'a> {
    /// Creates a new `IngestEncoder`.
    pub fn new(catalog: &'a TypeCatalog, default_element_type: &'a str, location: &'a str) -> Self {
        Self {
            catalog,
            default_element_type,
            location,
            payload_size: 25,
            max_event_title_length: 255,
        }
    }

    /// Sets the payload size cap used when merging elements.
    pub fn with_payload_size(mut self, payload_size: usize) -> Self {
        self.payload_size = payload_size;
        self
    }

    /// Sets the maximum length of event titles, in characters.
    pub fn with_max_event_title_length(mut self, max_event_title_length: usize) -> Self {
        self.max_event_title_length = max_event_title_length;
        self
    }

    /// Builds one element fragment per metric, attribute, relation, or tag, sorted by element id.
    ///
    /// The sort is stable, so fragments of the same element keep their relative order.
    pub fn encode_elements(&self, values: &[CollectableValue]) -> Vec<IngestElement> {
        let mut elements = values
            .iter()
            .filter_map(|value| match value {
                CollectableValue::Metric(metric) => Some(self.metric_element(metric)),
                CollectableValue::Attribute(attribute) => Some(self.attribute_element(attribute)),
                CollectableValue::Relation(relation) => Some(self.relation_element(relation)),
                CollectableValue::Tag(tag) => Some(self.tag_element(tag)),
                CollectableValue::Event(_) | CollectableValue::Check(_) => None,
            })
            .collect::<Vec<_>>();
        elements.sort_by(|a, b| a.id.cmp(&b.id));
        elements
    }

    /// Merges adjacent fragments of the same element.
    ///
    /// Fragments are folded into the current element while their ids match and the running payload size is below
    /// the cap. A fragment that does not fit starts a new element, so one host may produce several elements.
    pub fn merge_elements(&self, elements: Vec<IngestElement>) -> Vec<IngestElement> {
        let mut merged: Vec<IngestElement> = Vec::new();
        let mut current_size = 0;

        for element in elements {
            match merged.last_mut() {
                Some(current) if current.id == element.id && current_size < self.payload_size => {
                    current_size += element.payload_size();
                    current.merge(element);
                }
                _ => {
                    current_size = element.payload_size();
                    merged.push(element);
                }
            }
        }

        merged
    }

    /// Builds the event payload for every event in `values`.
    pub fn encode_events(&self, values: &[CollectableValue]) -> Vec<IngestEvent> {
        values
            .iter()
            .filter_map(|value| match value {
                CollectableValue::Event(event) => Some(self.event(event)),
                _ => None,
            })
            .collect()
    }

    fn element_for(&self, value_meta: &ValueMeta) -> IngestElement {
        let element_type = value_meta.element_type.as_deref().unwrap_or(self.default_element_type);
        IngestElement::new(&value_meta.host, element_type, self.location)
    }

    fn metric_element(&self, metric: &Metric) -> IngestElement {
        let mut element = self.element_for(&metric.meta);

        let Some(sources) = self.catalog.get(&metric.meta.type_name) else {
            warn!(type_name = %metric.meta.type_name, "Metric type not found in type catalog. Skipping.");
            return element;
        };
        if sources.len() != metric.values.len() {
            warn!(
                type_name = %metric.meta.type_name,
                expected = sources.len(),
                actual = metric.values.len(),
                "Metric value count does not match its type. Skipping."
            );
            return element;
        }

        let base_id = metric_id(metric);
        let timestamp = (metric.meta.timestamp * 1000.0) as i64;
        let compound = sources.len() > 1;

        for (idx, (source, value)) in sources.iter().zip(&metric.values).enumerate() {
            let id = if compound {
                format!("{}.{}", base_id, source.name)
            } else {
                base_id.clone()
            };
            let name = metric.friendly_names.get(idx).cloned().unwrap_or_else(|| id.clone());

            element.metrics.push(IngestMetric {
                id: id.clone(),
                unit: metric.meta.type_name.clone(),
                name,
                metric_type: (source.kind == DataSourceKind::Counter).then_some("COUNTER"),
            });
            element.samples.push(IngestSample {
                metric_id: id,
                timestamp,
                val: *value,
            });
        }

        element
    }

    fn attribute_element(&self, attribute: &Attribute) -> IngestElement {
        let mut element = self.element_for(&attribute.meta);
        element.attributes.push(IngestAttribute {
            name: attribute.name.clone(),
            value: attribute.value.clone(),
        });
        element
    }

    fn relation_element(&self, relation: &Relation) -> IngestElement {
        let mut element = self.element_for(&relation.meta);
        element.relations.push(IngestRelation {
            fqn: relation.fqn.clone(),
        });
        element
    }

    fn tag_element(&self, tag: &Tag) -> IngestElement {
        let mut element = self.element_for(&tag.meta);
        element.tags.push(IngestTag {
            name: tag.name.clone(),
            value: tag.value.clone(),
        });
        element
    }

    fn event(&self, event: &Event) -> IngestEvent {
        IngestEvent {
            event_type: "INFO",
            source: event.meta.plugin.clone(),
            data: IngestEventData {
                element_id: event.meta.host.clone(),
                level: ingest_level(event.level),
                message: event.message.clone(),
            },
            title: event.title.chars().take(self.max_event_title_length).collect(),
            timestamp: (event.meta.timestamp * 1000.0) as i64,
        }
    }
}

const fn ingest_level(level: EventLevel) -> &'static str {
    match level {
        EventLevel::Critical | EventLevel::Error => "CRITICAL",
        EventLevel::Warn => "WARNING",
        EventLevel::Info | EventLevel::Debug => "INFO",
    }
}

/// Builds the metric id `plugin[.plugin_instance][.type_instance]`.
///
/// Spaces become underscores, and anything outside of `[A-Za-z0-9._-]` is removed.
fn metric_id(metric: &Metric) -> String {
    let meta = &metric.meta;
    let mut id = meta.plugin.clone();
    for part in [&meta.plugin_instance, &meta.type_instance] {
        if !part.is_empty() {
            id.push('.');
            id.push_str(part);
        }
    }

    id.chars()
        .filter_map(|c| match c {
            ' ' => Some('_'),
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') => Some(c),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn catalog() -> TypeCatalog {
        TypeCatalog::builtin()
    }

    fn gauge(host: &str, type_instance: &str, value: f64) -> CollectableValue {
        let meta = ValueMeta::new(host, "statsd")
            .with_type("gauge")
            .with_type_instance(type_instance)
            .with_timestamp(1_700_000_000.5);
        Metric::single(meta, value).into()
    }

    fn attribute(host: &str, name: &str) -> CollectableValue {
        CollectableValue::Attribute(Attribute {
            meta: ValueMeta::new(host, "attributes"),
            name: name.to_string(),
            value: "x".to_string(),
        })
    }

    #[test]
    fn single_value_metric() {
        let catalog = catalog();
        let encoder = IngestEncoder::new(&catalog, "SERVER", "dc1");

        let meta = ValueMeta::new("web-01", "cpu")
            .with_plugin_instance("0")
            .with_type("percent")
            .with_type_instance("idle time")
            .with_timestamp(10.25);
        let elements = encoder.encode_elements(&[CollectableValue::from(Metric::single(meta, 97.5))]);

        assert_eq!(
            serde_json::to_value(&elements).unwrap(),
            json!([{
                "id": "web-01",
                "name": "web-01",
                "type": "SERVER",
                "location": "dc1",
                "metrics": [{ "id": "cpu.0.idle_time", "unit": "percent", "name": "cpu.0.idle_time" }],
                "samples": [{ "metricId": "cpu.0.idle_time", "timestamp": 10250, "val": 97.5 }],
                "attributes": [],
                "relations": [],
                "tags": [],
            }])
        );
    }

    #[test]
    fn compound_metric_uses_data_source_names() {
        let catalog = catalog();
        let encoder = IngestEncoder::new(&catalog, "SERVER", "");

        let meta = ValueMeta::new("web-01", "interface")
            .with_plugin_instance("eth0 (primary)")
            .with_type("if_octets")
            .with_element_type("ROUTER");
        let elements = encoder.encode_elements(&[CollectableValue::from(Metric::new(meta, vec![1.0, 2.0]))]);

        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].element_type, "ROUTER");
        let ids = elements[0].metrics.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["interface.eth0_primary.rx", "interface.eth0_primary.tx"]);
        assert!(elements[0].metrics.iter().all(|m| m.metric_type.is_none()));
        assert_eq!(elements[0].samples[1].val, 2.0);
    }

    #[test]
    fn counter_metrics_are_flagged() {
        let catalog = catalog();
        let encoder = IngestEncoder::new(&catalog, "SERVER", "");

        let meta = ValueMeta::new("web-01", "statsd").with_type("counter").with_type_instance("hits");
        let elements = encoder.encode_elements(&[CollectableValue::from(Metric::single(meta, 1.0))]);
        assert_eq!(elements[0].metrics[0].metric_type, Some("COUNTER"));
    }

    #[test]
    fn unknown_type_produces_no_metrics() {
        let catalog = catalog();
        let encoder = IngestEncoder::new(&catalog, "SERVER", "");

        let meta = ValueMeta::new("web-01", "custom").with_type("mystery");
        let elements = encoder.encode_elements(&[CollectableValue::from(Metric::single(meta, 1.0))]);
        assert_eq!(elements[0].payload_size(), 0);
        assert!(elements[0].samples.is_empty());
    }

    #[test]
    fn merge_splits_at_payload_size() {
        let catalog = catalog();
        let encoder = IngestEncoder::new(&catalog, "SERVER", "").with_payload_size(25);

        let values = (0..30)
            .map(|i| gauge("web-01", &format!("m{}", i), i as f64))
            .collect::<Vec<_>>();
        let merged = encoder.merge_elements(encoder.encode_elements(&values));

        let sizes = merged.iter().map(IngestElement::payload_size).collect::<Vec<_>>();
        assert_eq!(sizes, vec![25, 5]);
        assert!(merged.iter().all(|e| e.id == "web-01"));
        assert_eq!(merged[0].samples.len(), 25);
    }

    #[test]
    fn merge_keeps_hosts_apart() {
        let catalog = catalog();
        let encoder = IngestEncoder::new(&catalog, "SERVER", "");

        let values = vec![
            gauge("web-02", "a", 1.0),
            attribute("web-01", "os"),
            gauge("web-01", "b", 2.0),
            gauge("web-02", "c", 3.0),
        ];
        let merged = encoder.merge_elements(encoder.encode_elements(&values));

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, "web-01");
        assert_eq!(merged[0].payload_size(), 2);
        assert_eq!(merged[1].id, "web-02");
        let ids = merged[1].metrics.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["statsd.a", "statsd.c"]);
    }

    #[test]
    fn events_map_levels_and_truncate_titles() {
        let catalog = catalog();
        let encoder = IngestEncoder::new(&catalog, "SERVER", "").with_max_event_title_length(4);

        let event = |level, title: &str| {
            CollectableValue::Event(Event {
                meta: ValueMeta::new("web-01", "eventlog").with_timestamp(2.0),
                id: 1,
                level,
                title: title.to_string(),
                message: "disk is full".to_string(),
            })
        };
        let values = vec![
            event(EventLevel::Error, "Disk full"),
            event(EventLevel::Warn, "Low"),
            event(EventLevel::Debug, "Note"),
            gauge("web-01", "a", 1.0),
        ];

        let events = encoder.encode_events(&values);
        assert_eq!(
            serde_json::to_value(&events[0]).unwrap(),
            json!({
                "type": "INFO",
                "source": "eventlog",
                "data": { "elementId": "web-01", "level": "CRITICAL", "message": "disk is full" },
                "title": "Disk",
                "timestamp": 2000,
            })
        );
        let levels = events.iter().map(|e| e.data.level).collect::<Vec<_>>();
        assert_eq!(levels, vec!["CRITICAL", "WARNING", "INFO"]);
        assert_eq!(events[1].title, "Low");
    }
}
