//! Host telemetry agent.
//!
//! Collects metrics, events, and checks from the configured sources on a fixed interval, converts counters to rates,
//! and delivers everything to the configured destinations.

#![deny(missing_docs)]

use clap::Parser as _;
use hostpulse_app::prelude::*;
use tracing::{error, info};

mod config;
use self::config::{load_configuration, Cli};

mod run;
use self::run::{build_plugins, run};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let configuration = load_configuration(&cli.config).unwrap_or_else(|e| fatal_and_exit(format!("{:#}", e)));
    let logging_config = LoggingConfiguration::from_configuration(&configuration)
        .unwrap_or_else(|e| fatal_and_exit(format!("invalid logging configuration: {:#}", e)));

    let _guard = initialize_logging(&logging_config)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to initialize logging: {:#}", e)));

    if cli.check {
        match build_plugins(&configuration) {
            Ok((_, plugins)) => {
                info!(
                    sources = plugins.sources().len(),
                    destinations = plugins.destinations().len(),
                    "Configuration is valid."
                );
                return;
            }
            Err(e) => fatal_and_exit(format!("invalid configuration: {:#}", e)),
        }
    }

    match run(cli.config, configuration).await {
        Ok(()) => info!("hostpulse stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}
