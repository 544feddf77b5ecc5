//! Type catalog.
//!
//! Every metric names a type, and the type determines how many values the metric carries, what each value is called,
//! and how each value behaves over time. The catalog is seeded with a small set of built-in types and can be extended
//! from a collectd-style `types.db` file.

use std::{collections::HashMap, fmt, path::Path, str::FromStr};

use hostpulse_error::{generic_error, ErrorContext as _, GenericError};
use tracing::{debug, warn};

const BUILTIN_TYPES: &str = "\
absolute     value:ABSOLUTE:0:U
bytes        value:GAUGE:0:U
count        value:GAUGE:0:U
counter      value:COUNTER:U:U
derive       value:DERIVE:0:U
disk_octets  read:DERIVE:0:U, write:DERIVE:0:U
gauge        value:GAUGE:U:U
if_octets    rx:DERIVE:0:U, tx:DERIVE:0:U
latency      value:GAUGE:0:U
load         shortterm:GAUGE:0:5000, midterm:GAUGE:0:5000, longterm:GAUGE:0:5000
objects      value:GAUGE:0:U
percent      value:GAUGE:0:100.1
";

/// How a data source's values behave over time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataSourceKind {
    /// An instantaneous reading.
    Gauge,

    /// A monotonically increasing count.
    Counter,

    /// A count that may also decrease.
    Derive,

    /// A count that resets on every read.
    Absolute,
}

impl DataSourceKind {
    /// Returns `true` if values of this kind should be converted to per-second rates.
    pub const fn is_rate_eligible(&self) -> bool {
        matches!(self, Self::Counter | Self::Derive)
    }

    /// Returns the lowercase name of this kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
            Self::Derive => "derive",
            Self::Absolute => "absolute",
        }
    }
}

impl fmt::Display for DataSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSourceKind {
    type Err = GenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GAUGE" => Ok(Self::Gauge),
            "COUNTER" => Ok(Self::Counter),
            "DERIVE" => Ok(Self::Derive),
            "ABSOLUTE" => Ok(Self::Absolute),
            _ => Err(generic_error!("Unknown data source kind '{}'.", s)),
        }
    }
}

/// A single named value within a type.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSource {
    /// Data source name.
    pub name: String,

    /// Data source kind.
    pub kind: DataSourceKind,

    /// Minimum valid value, if bounded.
    pub min: Option<f64>,

    /// Maximum valid value, if bounded.
    pub max: Option<f64>,
}

impl FromStr for DataSource {
    type Err = GenericError;

    /// Parses a `name:KIND:min:max` specification, where `U` marks an unbounded limit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.trim().split(':').collect::<Vec<_>>();
        let [name, kind, min, max] = parts.as_slice() else {
            return Err(generic_error!("Expected 'name:KIND:min:max', got '{}'.", s.trim()));
        };

        if name.is_empty() {
            return Err(generic_error!("Data source name cannot be empty."));
        }

        Ok(Self {
            name: name.to_string(),
            kind: kind.parse()?,
            min: parse_limit(min)?,
            max: parse_limit(max)?,
        })
    }
}

fn parse_limit(raw: &str) -> Result<Option<f64>, GenericError> {
    if raw == "U" {
        return Ok(None);
    }

    raw.parse()
        .map(Some)
        .with_error_context(|| format!("Invalid data source limit '{}'.", raw))
}

/// Mapping of type name to its ordered data sources.
#[derive(Clone, Debug, Default)]
pub struct TypeCatalog {
    types: HashMap<String, Vec<DataSource>>,
}

impl TypeCatalog {
    /// Creates a catalog holding only the built-in types.
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        catalog.load_types_db_str(BUILTIN_TYPES);
        catalog
    }

    /// Creates a catalog holding the built-in types, overlaid with the types from the given `types.db` file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, an error will be returned. Malformed lines are logged and skipped.
    pub fn from_types_db<P: AsRef<Path>>(path: P) -> Result<Self, GenericError> {
        let mut catalog = Self::builtin();
        catalog.load_types_db(path)?;
        Ok(catalog)
    }

    /// Loads types from the given `types.db` file, replacing any existing types with the same name.
    ///
    /// Returns the number of types loaded.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, an error will be returned. Malformed lines are logged and skipped.
    pub fn load_types_db<P: AsRef<Path>>(&mut self, path: P) -> Result<usize, GenericError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_error_context(|| format!("Failed to read types file '{}'.", path.display()))?;

        let loaded = self.load_types_db_str(&contents);
        debug!(path = %path.display(), loaded, "Loaded types file.");
        Ok(loaded)
    }

    /// Loads types from `types.db`-formatted text, replacing any existing types with the same name.
    ///
    /// Returns the number of types loaded.
    pub fn load_types_db_str(&mut self, contents: &str) -> usize {
        let mut loaded = 0;
        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_type_line(line) {
                Ok((name, sources)) => {
                    self.types.insert(name, sources);
                    loaded += 1;
                }
                Err(e) => warn!(line_number = idx + 1, error = %e, "Skipping malformed type definition."),
            }
        }
        loaded
    }

    /// Registers a type, replacing any existing type with the same name.
    pub fn insert<S: Into<String>>(&mut self, name: S, sources: Vec<DataSource>) {
        self.types.insert(name.into(), sources);
    }

    /// Returns the data sources for the given type, if it is known.
    pub fn get(&self, type_name: &str) -> Option<&[DataSource]> {
        self.types.get(type_name).map(|sources| sources.as_slice())
    }

    /// Returns the number of known types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns `true` if no types are known.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

fn parse_type_line(line: &str) -> Result<(String, Vec<DataSource>), GenericError> {
    let (name, rest) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| generic_error!("Type '{}' has no data sources.", line))?;

    let sources = rest
        .split(',')
        .map(str::parse::<DataSource>)
        .collect::<Result<Vec<_>, _>>()
        .with_error_context(|| format!("Invalid data sources for type '{}'.", name))?;

    Ok((name.to_string(), sources))
}
