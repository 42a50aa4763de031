use dyn_clone::DynClone;

use crate::types::{Event, EventKind, Timestamp};

/// Provides the transport latency a delay bus applies to an event.
///
/// The returned delay must be non-negative. The model is cloneable as a trait
/// object because one configured model is cloned into each direction's bus.
pub trait LatencyModel: DynClone {
    /// Returns the delay for the given event, in the same time unit as the
    /// data's timestamps.
    fn delay(&mut self, event: &Event) -> Timestamp;
}

dyn_clone::clone_trait_object!(LatencyModel);

/// Provides a constant latency for every event.
#[derive(Clone)]
pub struct ConstantLatency {
    delay: Timestamp,
}

impl ConstantLatency {
    /// Constructs an instance of `ConstantLatency`.
    ///
    /// `delay` should match the time unit of the data's timestamps.
    pub fn new(delay: Timestamp) -> Self {
        assert!(delay >= 0, "latency must be non-negative");
        Self { delay }
    }
}

impl LatencyModel for ConstantLatency {
    fn delay(&mut self, _event: &Event) -> Timestamp {
        self.delay
    }
}

/// Provides distinct latencies for order traffic and market-data traffic.
///
/// Order entry usually rides a different path than feed distribution, so the
/// two are commonly modeled with different delays.
#[derive(Clone)]
pub struct OrderPriorityLatency {
    order_delay: Timestamp,
    feed_delay: Timestamp,
}

impl OrderPriorityLatency {
    /// Constructs an instance of `OrderPriorityLatency`.
    pub fn new(order_delay: Timestamp, feed_delay: Timestamp) -> Self {
        assert!(
            order_delay >= 0 && feed_delay >= 0,
            "latency must be non-negative"
        );
        Self {
            order_delay,
            feed_delay,
        }
    }
}

impl LatencyModel for OrderPriorityLatency {
    fn delay(&mut self, event: &Event) -> Timestamp {
        match event.kind() {
            EventKind::Order => self.order_delay,
            _ => self.feed_delay,
        }
    }
}
