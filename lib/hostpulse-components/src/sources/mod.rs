//! Source implementations.

/// Statsd source implementation.
pub mod statsd;
pub use self::statsd::{StatsdConfiguration, StatsdSource};
