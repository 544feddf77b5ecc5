//! Values flowing through the pipeline.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

/// Returns the current time as fractional seconds since the Unix epoch.
pub fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Fields shared by every collectable value.
///
/// The taxonomy fields (`plugin`, `plugin_instance`, `type_name`, `type_instance`) follow the collectd naming model, and
/// together with `host` form the identity of a metric.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueMeta {
    /// Host the value describes.
    pub host: String,

    /// Collection time, in seconds since the Unix epoch.
    pub timestamp: f64,

    /// Kind of element the host is reported as, if overridden.
    pub element_type: Option<String>,

    /// Collection interval, in seconds.
    ///
    /// Stamped by the writer loop before values are handed to destinations.
    pub interval: u64,

    /// Plugin that produced the value.
    pub plugin: String,

    /// Plugin instance.
    pub plugin_instance: String,

    /// Name of the type, used to look up data sources in the type catalog.
    pub type_name: String,

    /// Type instance.
    pub type_instance: String,
}

impl ValueMeta {
    /// Creates a new `ValueMeta` for the given host and plugin, timestamped now.
    pub fn new<H, P>(host: H, plugin: P) -> Self
    where
        H: Into<String>,
        P: Into<String>,
    {
        Self {
            host: host.into(),
            timestamp: now_seconds(),
            element_type: None,
            interval: 0,
            plugin: plugin.into(),
            plugin_instance: String::new(),
            type_name: String::new(),
            type_instance: String::new(),
        }
    }

    /// Sets the plugin instance.
    pub fn with_plugin_instance<S: Into<String>>(mut self, plugin_instance: S) -> Self {
        self.plugin_instance = plugin_instance.into();
        self
    }

    /// Sets the type name.
    pub fn with_type<S: Into<String>>(mut self, type_name: S) -> Self {
        self.type_name = type_name.into();
        self
    }

    /// Sets the type instance.
    pub fn with_type_instance<S: Into<String>>(mut self, type_instance: S) -> Self {
        self.type_instance = type_instance.into();
        self
    }

    /// Sets the timestamp, in seconds since the Unix epoch.
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the element type.
    pub fn with_element_type<S: Into<String>>(mut self, element_type: S) -> Self {
        self.element_type = Some(element_type.into());
        self
    }

    /// Returns the identity key: `host.plugin.plugin_instance.type_name.type_instance`.
    pub fn identity_key(&self) -> String {
        format!(
            "{}.{}.{}.{}.{}",
            self.host, self.plugin, self.plugin_instance, self.type_name, self.type_instance
        )
    }
}

/// A numeric sample with one value per data source of its type.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    /// Common fields.
    pub meta: ValueMeta,

    /// Sample values, parallel to the data sources registered for the type.
    pub values: Vec<f64>,

    /// Human-readable names, parallel to `values`.
    pub friendly_names: Vec<String>,
}

impl Metric {
    /// Creates a new `Metric`.
    pub fn new(meta: ValueMeta, values: Vec<f64>) -> Self {
        Self {
            meta,
            values,
            friendly_names: Vec::new(),
        }
    }

    /// Creates a new single-valued `Metric`.
    pub fn single(meta: ValueMeta, value: f64) -> Self {
        Self::new(meta, vec![value])
    }
}

/// A key/value fact about a host.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    /// Common fields.
    pub meta: ValueMeta,

    /// Attribute name.
    pub name: String,

    /// Attribute value.
    pub value: String,
}

/// A relation from a host to another element, by fully-qualified name.
#[derive(Clone, Debug, PartialEq)]
pub struct Relation {
    /// Common fields.
    pub meta: ValueMeta,

    /// Fully-qualified name of the related element.
    pub fqn: String,
}

/// A tag attached to a host.
#[derive(Clone, Debug, PartialEq)]
pub struct Tag {
    /// Common fields.
    pub meta: ValueMeta,

    /// Tag name.
    pub name: String,

    /// Tag value.
    pub value: String,
}

/// Severity of an [`Event`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    /// Critical.
    Critical,

    /// Error.
    Error,

    /// Warning.
    Warn,

    /// Informational.
    Info,

    /// Debug.
    Debug,
}

impl EventLevel {
    /// Returns the level name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discrete occurrence on a host.
///
/// Events are identified by `id` alone: two events with the same `id` are equal regardless of their contents.
#[derive(Clone, Debug)]
pub struct Event {
    /// Common fields.
    pub meta: ValueMeta,

    /// Deduplication key.
    pub id: i64,

    /// Severity.
    pub level: EventLevel,

    /// Short summary.
    pub title: String,

    /// Full message.
    pub message: String,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A liveness check for a host.
///
/// The backend considers the check failed if it is not refreshed within `check_interval` seconds.
#[derive(Clone, Debug, PartialEq)]
pub struct Check {
    /// Common fields.
    pub meta: ValueMeta,

    /// Check name.
    pub name: String,

    /// Time-to-live, in seconds.
    pub check_interval: u64,
}

/// Anything a source can produce and a destination can deliver.
#[derive(Clone, Debug, PartialEq)]
pub enum CollectableValue {
    /// A numeric sample.
    Metric(Metric),

    /// A host attribute.
    Attribute(Attribute),

    /// A relation to another element.
    Relation(Relation),

    /// A host event.
    Event(Event),

    /// A liveness check.
    Check(Check),

    /// A host tag.
    Tag(Tag),
}

impl CollectableValue {
    /// Returns the common fields.
    pub fn meta(&self) -> &ValueMeta {
        match self {
            Self::Metric(v) => &v.meta,
            Self::Attribute(v) => &v.meta,
            Self::Relation(v) => &v.meta,
            Self::Event(v) => &v.meta,
            Self::Check(v) => &v.meta,
            Self::Tag(v) => &v.meta,
        }
    }

    /// Returns the common fields, mutably.
    pub fn meta_mut(&mut self) -> &mut ValueMeta {
        match self {
            Self::Metric(v) => &mut v.meta,
            Self::Attribute(v) => &mut v.meta,
            Self::Relation(v) => &mut v.meta,
            Self::Event(v) => &mut v.meta,
            Self::Check(v) => &mut v.meta,
            Self::Tag(v) => &mut v.meta,
        }
    }

    /// Returns the identity key of this value.
    pub fn identity_key(&self) -> String {
        self.meta().identity_key()
    }

    /// Returns a short name for the kind of value, for logging.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Metric(_) => "metric",
            Self::Attribute(_) => "attribute",
            Self::Relation(_) => "relation",
            Self::Event(_) => "event",
            Self::Check(_) => "check",
            Self::Tag(_) => "tag",
        }
    }
}

impl From<Metric> for CollectableValue {
    fn from(value: Metric) -> Self {
        Self::Metric(value)
    }
}

impl From<Event> for CollectableValue {
    fn from(value: Event) -> Self {
        Self::Event(value)
    }
}

impl From<Check> for CollectableValue {
    fn from(value: Check) -> Self {
        Self::Check(value)
    }
}
