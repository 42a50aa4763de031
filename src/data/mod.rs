//! Event datasets: in-memory sources, CSV file readers, and the k-way merge
//! that feeds the backtest.

use std::{cmp::Ordering, collections::BinaryHeap, mem};

pub use csv::CsvDataset;

use crate::types::{Event, Timestamp};

mod csv;

/// An ordered event source. Timestamps must be non-decreasing within one
/// source; ordering across sources is the merge's job.
pub type DataSource = Box<dyn Iterator<Item = Event>>;

/// An in-memory ordered event source, mainly for tests and synthetic runs.
pub struct VecDataset {
    events: std::vec::IntoIter<Event>,
}

impl VecDataset {
    /// Constructs a `VecDataset` from events already ordered by timestamp.
    pub fn new(events: Vec<Event>) -> Self {
        debug_assert!(
            events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp),
            "VecDataset events must be ordered by timestamp"
        );
        Self {
            events: events.into_iter(),
        }
    }
}

impl Iterator for VecDataset {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.events.next()
    }
}

struct Head {
    timestamp: Timestamp,
    index: usize,
    event: Event,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.index == other.index
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap and the earliest head must win
        (other.timestamp, other.index).cmp(&(self.timestamp, self.index))
    }
}

/// A stable k-way merge over ordered event sources.
///
/// Events emit in timestamp order; at equal timestamps the source with the
/// lower index wins. The most recently emitted source is kept out of the heap:
/// as long as its next event does not have to yield to the heap top it emits
/// with a single comparison, and switching sources costs one heap replace.
/// With bursty feeds, where consecutive events usually come from the same
/// file, most steps take the O(1) path.
pub struct MergedDataset {
    sources: Vec<DataSource>,
    heap: BinaryHeap<Head>,
    current: Option<(usize, Event)>,
}

impl MergedDataset {
    /// Constructs a `MergedDataset` over the given sources.
    pub fn new(mut sources: Vec<DataSource>) -> Self {
        let mut heads: Vec<(usize, Event)> = sources
            .iter_mut()
            .enumerate()
            .filter_map(|(index, source)| source.next().map(|event| (index, event)))
            .collect();

        let mut heap = BinaryHeap::with_capacity(heads.len());
        let best = heads
            .iter()
            .enumerate()
            .min_by_key(|(_, head)| (head.1.timestamp, head.0))
            .map(|(pos, _)| pos);
        let current = best.map(|pos| heads.swap_remove(pos));
        for (index, event) in heads {
            heap.push(Head {
                timestamp: event.timestamp,
                index,
                event,
            });
        }

        Self {
            sources,
            heap,
            current,
        }
    }
}

impl Iterator for MergedDataset {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let (index, event) = self.current.take()?;

        match self.sources[index].next() {
            Some(succ) => {
                // The full (timestamp, index) key decides whether the biased
                // source keeps the lead; comparing timestamps alone would let
                // it overtake an earlier-indexed source at an equal timestamp.
                let must_yield = self
                    .heap
                    .peek()
                    .is_some_and(|top| (top.timestamp, top.index) < (succ.timestamp, index));
                if must_yield {
                    let mut top = self.heap.peek_mut().expect("peeked above");
                    let prev = mem::replace(
                        &mut *top,
                        Head {
                            timestamp: succ.timestamp,
                            index,
                            event: succ,
                        },
                    );
                    drop(top);
                    self.current = Some((prev.index, prev.event));
                } else {
                    self.current = Some((index, succ));
                }
            }
            None => {
                // source exhausted; promote the heap top if any remains
                if let Some(head) = self.heap.pop() {
                    self.current = Some((head.index, head.event));
                }
            }
        }

        Some(event)
    }
}
