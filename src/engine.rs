use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use tracing::trace;

use crate::types::{next_identity, Event, EventKind, Identity, Timestamp};

/// A listener bound to an event engine.
pub type Listener = Box<dyn FnMut(&Event)>;

struct ListenerEntry {
    id: Identity,
    ignore_self: bool,
    callback: RefCell<Listener>,
}

#[derive(Default)]
struct ListenerTable {
    /// Global listeners that run before the kind listeners.
    senior: Vec<ListenerEntry>,
    /// Global listeners that run after the kind listeners.
    junior: Vec<ListenerEntry>,
    by_kind: [Vec<ListenerEntry>; EventKind::COUNT],
}

struct EngineInner {
    id: Identity,
    clock: Cell<Timestamp>,
    queue: RefCell<VecDeque<Event>>,
    dispatching: Cell<bool>,
    current_listener: Cell<Identity>,
    listeners: RefCell<ListenerTable>,
}

/// Single-threaded FIFO event dispatcher with a logical clock.
///
/// The engine is a cheap-clone handle over shared state, so listeners can
/// re-enter [`put`](EventEngine::put) while a dispatch is running; events
/// enqueued during a dispatch are drained in strict FIFO order by the
/// outermost `put`.
///
/// Listeners bind to an exact payload kind; there is no polymorphic dispatch.
/// For each dequeued event the dispatch order is: all senior globals, then the
/// kind listeners in registration order, then all junior globals. A listener
/// that panics aborts the dispatch loop and propagates; the engine is left
/// inconsistent and the run ends.
#[derive(Clone)]
pub struct EventEngine {
    inner: Rc<EngineInner>,
}

impl EventEngine {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(EngineInner {
                id: next_identity(),
                clock: Cell::new(0),
                queue: RefCell::new(VecDeque::new()),
                dispatching: Cell::new(false),
                current_listener: Cell::new(0),
                listeners: RefCell::new(ListenerTable::default()),
            }),
        }
    }

    /// Returns the identity stamped into `source` for events that first enter
    /// this engine.
    #[inline]
    pub fn id(&self) -> Identity {
        self.inner.id
    }

    /// Returns the engine's logical clock.
    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.inner.clock.get()
    }

    /// Advances the clock to `timestamp` if it is ahead of the current value.
    /// Used by the delay buses when delivering an event whose ready time is
    /// past the target engine's clock.
    pub(crate) fn advance_clock_to(&self, timestamp: Timestamp) {
        if timestamp > self.inner.clock.get() {
            self.inner.clock.set(timestamp);
        }
    }

    /// Binds `listener` to events of exactly `kind` and returns its identity.
    ///
    /// With `ignore_self`, the listener is skipped for events it produced
    /// itself, which breaks direct self-recursion. It does not isolate
    /// different listeners of the same component from one another.
    ///
    /// Registering while a dispatch is running is a programmer error and
    /// panics.
    pub fn register<F>(&self, kind: EventKind, ignore_self: bool, listener: F) -> Identity
    where
        F: FnMut(&Event) + 'static,
    {
        assert!(
            !self.inner.dispatching.get(),
            "listener registered during dispatch"
        );
        let id = next_identity();
        self.inner.listeners.borrow_mut().by_kind[kind as usize].push(ListenerEntry {
            id,
            ignore_self,
            callback: RefCell::new(Box::new(listener)),
        });
        id
    }

    /// Binds `listener` to every event and returns its identity. Senior
    /// globals run before the kind listeners, junior globals after.
    pub fn register_global<F>(&self, ignore_self: bool, is_senior: bool, listener: F) -> Identity
    where
        F: FnMut(&Event) + 'static,
    {
        assert!(
            !self.inner.dispatching.get(),
            "listener registered during dispatch"
        );
        let id = next_identity();
        let entry = ListenerEntry {
            id,
            ignore_self,
            callback: RefCell::new(Box::new(listener)),
        };
        let mut table = self.inner.listeners.borrow_mut();
        if is_senior {
            table.senior.push(entry);
        } else {
            table.junior.push(entry);
        }
        id
    }

    /// Enqueues `event` and, if no dispatch is running, drains the queue.
    ///
    /// Header stamping: `source` is set to this engine's identity only if it
    /// is still zero; `producer` is overwritten with the identity of the
    /// currently running listener, or zero outside of a dispatch. Clock rules:
    /// a zero timestamp inherits the engine clock, a timestamp ahead of the
    /// clock advances it, and an older timestamp leaves both untouched so the
    /// clock never regresses.
    pub fn put(&self, mut event: Event) {
        let inner = &self.inner;
        if event.source == 0 {
            event.source = inner.id;
        }
        event.producer = inner.current_listener.get();
        let ts = event.timestamp;
        if ts == 0 {
            event.timestamp = inner.clock.get();
        } else if ts > inner.clock.get() {
            inner.clock.set(ts);
        }
        inner.queue.borrow_mut().push_back(event);
        if !inner.dispatching.get() {
            self.drain();
        }
    }

    fn drain(&self) {
        let inner = &self.inner;
        inner.dispatching.set(true);
        loop {
            let event = {
                let mut queue = inner.queue.borrow_mut();
                queue.pop_front()
            };
            let Some(event) = event else {
                break;
            };
            trace!(engine = inner.id, ts = event.timestamp, kind = ?event.kind(), "dispatch");
            let table = inner.listeners.borrow();
            let kind_listeners = &table.by_kind[event.kind() as usize];
            for entry in table
                .senior
                .iter()
                .chain(kind_listeners.iter())
                .chain(table.junior.iter())
            {
                if entry.ignore_self && event.producer == entry.id {
                    continue;
                }
                inner.current_listener.set(entry.id);
                let mut callback = entry.callback.borrow_mut();
                (&mut **callback)(&event);
                drop(callback);
                inner.current_listener.set(0);
            }
        }
        inner.dispatching.set(false);
    }
}

impl Default for EventEngine {
    fn default() -> Self {
        Self::new()
    }
}
