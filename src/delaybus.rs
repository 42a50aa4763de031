use std::{cell::RefCell, cmp::Ordering, collections::BinaryHeap, rc::Rc};

use tracing::trace;

use crate::{
    engine::EventEngine,
    models::LatencyModel,
    types::{Event, Timestamp, INVALID_MAX},
};

struct BusEntry {
    ready_ts: Timestamp,
    /// Insertion counter; keeps entries with equal ready times stable.
    seq: u64,
    event: Event,
}

impl PartialEq for BusEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_ts == other.ready_ts && self.seq == other.seq
    }
}

impl Eq for BusEntry {}

impl PartialOrd for BusEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BusEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap and the earliest entry must win
        (other.ready_ts, other.seq).cmp(&(self.ready_ts, self.seq))
    }
}

struct BusState {
    heap: BinaryHeap<BusEntry>,
    seq: u64,
    latency: Box<dyn LatencyModel>,
}

/// Transports events from a source engine to a target engine with a per-event
/// delay.
///
/// The bus registers itself on the source engine as a junior global listener,
/// so with a zero delay an event still reaches the target only after every
/// component on the source side has seen it. Only events whose `source` is the
/// source engine itself are picked up; events that arrived through the
/// opposite bus keep their original source and are ignored, which prevents
/// echo between two engines bridged in both directions.
///
/// The bus stores a derived copy of each event with the timestamp and source
/// restored, so mutating the original after send cannot leak into transit and
/// the origin engine stays attributable at the far side.
pub struct DelayBus {
    state: Rc<RefCell<BusState>>,
    target: EventEngine,
}

impl DelayBus {
    /// Constructs a `DelayBus` delivering into `target`.
    pub fn new(latency: Box<dyn LatencyModel>, target: EventEngine) -> Self {
        Self {
            state: Rc::new(RefCell::new(BusState {
                heap: BinaryHeap::new(),
                seq: 0,
                latency,
            })),
            target,
        }
    }

    /// Registers this bus on its source engine. Must be called once before
    /// the run starts.
    pub fn attach(&self, source: &EventEngine) {
        let state = Rc::clone(&self.state);
        let source_id = source.id();
        source.register_global(false, false, move |event| {
            if event.source != source_id {
                return;
            }
            let mut state = state.borrow_mut();
            let delay = state.latency.delay(event);
            debug_assert!(delay >= 0, "latency model returned a negative delay");
            let ready_ts = event.timestamp + delay.max(0);
            let mut snapshot = event.derive();
            snapshot.timestamp = event.timestamp;
            snapshot.source = event.source;
            let seq = state.seq;
            state.seq += 1;
            trace!(source = source_id, ready_ts, "bus enqueue");
            state.heap.push(BusEntry {
                ready_ts,
                seq,
                event: snapshot,
            });
        });
    }

    /// Returns the ready time of the earliest queued event, or
    /// [`INVALID_MAX`] when the bus is empty.
    pub fn next_timestamp(&self) -> Timestamp {
        self.state
            .borrow()
            .heap
            .peek()
            .map(|entry| entry.ready_ts)
            .unwrap_or(INVALID_MAX)
    }

    /// Delivers every queued event whose ready time is at or before
    /// `timestamp`, advancing the target engine's clock to each ready time
    /// before the event is put.
    pub fn process_until(&self, timestamp: Timestamp) {
        loop {
            let entry = {
                let mut state = self.state.borrow_mut();
                match state.heap.peek() {
                    Some(entry) if entry.ready_ts <= timestamp => state.heap.pop(),
                    _ => None,
                }
            };
            let Some(entry) = entry else {
                break;
            };
            // the borrow is released above: delivery may re-enter a bus
            // listener on the target side
            self.target.advance_clock_to(entry.ready_ts);
            self.target.put(entry.event);
        }
    }

    /// Returns `true` if no events are in transit.
    pub fn is_empty(&self) -> bool {
        self.state.borrow().heap.is_empty()
    }
}
