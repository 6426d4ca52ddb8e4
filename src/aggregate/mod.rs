//! Rolling PSM evidence up into feature-level quantities.

pub mod features;

pub use features::{aggregate_features, AggregateConfig, AggregateReport};
