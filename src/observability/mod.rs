//! Metrics collected by the dispatch core.

pub mod metrics;

pub use metrics::{Metrics, MetricsError};
