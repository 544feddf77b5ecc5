//! Core primitives for the hostpulse agent: the value model, the plugin contracts, and the collection pipeline that
//! connects them.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod catalog;
pub mod data_model;
pub mod pipeline;
pub mod plugin;
pub mod registry;

mod queue;
pub use self::queue::BoundedQueue;

mod rate;
pub use self::rate::RateAggregator;
