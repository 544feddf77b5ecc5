use std::path::{Path, PathBuf};

use clap::Parser;
use hostpulse_config::{ConfigurationLoader, GenericConfiguration};
use hostpulse_error::{ErrorContext as _, GenericError};

/// Prefix of environment variables that override configuration file settings.
pub const ENV_VAR_PREFIX: &str = "HOSTPULSE";

#[derive(Clone, Debug, Parser)]
#[command(about, version)]
pub struct Cli {
    /// Path to the configuration file.
    ///
    /// Files ending in `.json` are read as JSON, and anything else as YAML. Every setting can be overridden with a
    /// `HOSTPULSE_`-prefixed environment variable, using a double underscore to separate nested keys
    /// (`HOSTPULSE_STATSD__PORT`).
    #[arg(short, long, default_value = "/etc/hostpulse/hostpulse.yaml")]
    pub config: PathBuf,

    /// Validate the configuration and exit without starting the pipeline.
    #[arg(long)]
    pub check: bool,
}

/// Loads the agent configuration from `path`, with environment variable overrides applied on top.
///
/// # Errors
///
/// If the file cannot be read or parsed, an error is returned.
pub fn load_configuration(path: &Path) -> Result<GenericConfiguration, GenericError> {
    let loader = ConfigurationLoader::default();
    let loader = if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
        loader.from_json(path)
    } else {
        loader.from_yaml(path)
    }
    .with_error_context(|| format!("Failed to load configuration file '{}'.", path.display()))?;

    let config = loader
        .from_environment(ENV_VAR_PREFIX)
        .error_context("Failed to read configuration from environment variables.")?
        .into_generic();
    Ok(config)
}
