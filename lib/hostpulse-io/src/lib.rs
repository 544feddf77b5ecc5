//! I/O primitives: the statsd wire codec, and the HTTP transport and retry building blocks used by destinations.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod codec;
pub mod net;
