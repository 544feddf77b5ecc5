//! Destination implementations.

mod delivery;
pub use self::delivery::{DeliveryBatcher, DeliveryOutcome};

mod http;
pub use self::http::{HttpConfiguration, HttpDestination};

/// Ingest destination implementation.
pub mod ingest;
pub use self::ingest::{IngestConfiguration, IngestDestination};
