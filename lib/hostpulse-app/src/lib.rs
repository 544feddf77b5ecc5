//! Application bootstrap primitives.
//!
//! Everything the agent binary needs to do before the pipeline starts lives here: currently, that means installing the
//! global `tracing` subscriber and reporting fatal startup errors.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration, LoggingGuard};
}
