//! Wire codecs.

pub mod statsd;
