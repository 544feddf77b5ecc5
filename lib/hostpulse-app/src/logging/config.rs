use std::path::PathBuf;

use hostpulse_config::GenericConfiguration;
use hostpulse_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_true() -> bool {
    true
}

const fn default_false() -> bool {
    false
}

/// Logging configuration.
///
/// Read from the top level of the agent configuration, so `log_level: debug` in the configuration file and
/// `HOSTPULSE_LOG_LEVEL=debug` in the environment are equivalent.
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    /// Filtering directives, in `EnvFilter` syntax.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Whether to emit logs as JSON objects, one per line.
    ///
    /// Defaults to `false`.
    #[serde(default = "default_false")]
    pub log_format_json: bool,

    /// Whether to write logs to standard output.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_true")]
    pub log_to_console: bool,

    /// Path of a file to additionally write logs to.
    ///
    /// The file is appended to, and never rotated.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let logging_config = config.as_typed()?;
        Ok(logging_config)
    }

    /// Creates a `LoggingConfiguration` that writes human-readable logs to the console at the given level.
    pub fn console(level: LevelFilter) -> Self {
        Self {
            log_level: level.into(),
            log_format_json: false,
            log_to_console: true,
            log_file: None,
        }
    }
}

/// Log filtering directives.
#[derive(Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevel(EnvFilter);

impl LogLevel {
    /// Returns the directives as an `EnvFilter`.
    pub fn as_env_filter(&self) -> EnvFilter {
        self.0.clone()
    }
}

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(value)
            .map(Self)
            .error_context("Failed to parse valid log level.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_directives() {
        assert!(LogLevel::try_from("debug".to_string()).is_ok());
        assert!(LogLevel::try_from("hostpulse_core=trace,warn".to_string()).is_ok());
        assert!(LogLevel::try_from(String::new()).is_err());
        assert!(LogLevel::try_from("hostpulse_core=loud".to_string()).is_err());
    }

    #[test]
    fn defaults_from_empty_configuration() {
        let config = hostpulse_config::ConfigurationLoader::default().into_generic();
        let logging = LoggingConfiguration::from_configuration(&config).unwrap();

        assert!(!logging.log_format_json);
        assert!(logging.log_to_console);
        assert!(logging.log_file.is_none());
    }
}
