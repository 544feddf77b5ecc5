//! Network primitives.

pub mod retry;

mod transport;
pub use self::transport::{ReqwestTransport, Transport, TransportError, TransportService};
