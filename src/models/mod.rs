//! Pluggable simulation models.

pub use latency::{ConstantLatency, LatencyModel, OrderPriorityLatency};

mod latency;
