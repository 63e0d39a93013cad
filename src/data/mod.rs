pub mod bar_aggregator;

pub use bar_aggregator::{AggregationResult, AggregatorRegistry, TimeframeAggregator};
