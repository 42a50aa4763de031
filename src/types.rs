use std::{
    io::Error as IoError,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;

use crate::order::Order;

/// Identity of an event engine or of a registered listener. `0` means
/// none: an event whose `source` is `0` has not entered any engine yet, and an
/// event whose `producer` is `0` was produced outside of a dispatch.
pub type Identity = u64;

/// Logical simulation time. The unit is whatever the dataset uses;
/// nanoseconds or milliseconds are both fine as long as every source agrees.
/// `0` means unset on ingress and the receiving engine assigns its clock.
pub type Timestamp = i64;

/// Fixed-point scale for prices and quantities: `value_int = round(value * SCALER)`.
/// Scaled integers are the canonical comparison key inside the order book.
pub const SCALER: i64 = 100_000_000;

/// Converts a float price or quantity to its scaled-integer representation.
#[inline]
pub fn to_scaled(value: f64) -> i64 {
    (value * SCALER as f64).round() as i64
}

/// Converts a scaled integer back to a float.
#[inline]
pub fn from_scaled(value: i64) -> f64 {
    value as f64 / SCALER as f64
}

/// Represents no best bid in scaled price units.
pub const INVALID_MIN: i64 = i64::MIN;

/// Represents no best ask in scaled price units.
pub const INVALID_MAX: i64 = i64::MAX;

/// Interned symbol name. Cloning is a reference-count bump; datasets intern at
/// the source so every event for one instrument shares a single allocation.
pub type Symbol = Rc<str>;

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// Returns a fresh process-wide identity. Engines and listeners draw from the
/// same sequence, so an engine id can never collide with a listener id.
pub(crate) fn next_identity() -> Identity {
    NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed)
}

/// Represents a side, which can refer to either the side of an order or the
/// taker's side in a trade event, with the meaning varying depending on the
/// context.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(i8)]
pub enum Side {
    /// The bid side of the book, or a trade whose initiator is a buyer.
    Buy = 1,
    /// The ask side of the book, or a trade whose initiator is a seller.
    Sell = -1,
}

impl Side {
    /// Returns `1.0` for buy and `-1.0` for sell.
    #[inline]
    pub fn sign(&self) -> f64 {
        *self as i8 as f64
    }
}

impl AsRef<str> for Side {
    fn as_ref(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Top-of-book snapshot: the best bid and ask with their displayed sizes,
/// published on change.
#[derive(Clone, Debug, PartialEq)]
pub struct BookTicker {
    pub symbol: Symbol,
    pub bid_price: f64,
    pub bid_qty: f64,
    pub ask_price: f64,
    pub ask_qty: f64,
}

/// Aggregated trade print: one or more executions at a single price, with the
/// total size and the taker's side.
#[derive(Clone, Debug, PartialEq)]
pub struct Trade {
    pub symbol: Symbol,
    pub price: f64,
    pub qty: f64,
    /// The aggressor's side.
    pub side: Side,
}

/// Periodic funding settlement for a perpetual contract.
#[derive(Clone, Debug, PartialEq)]
pub struct Funding {
    pub symbol: Symbol,
    pub funding_rate: f64,
    /// The mark price the funding fee is computed against.
    pub mark_price: f64,
}

/// Delivery or expiry of a contract. All positions and resting orders for the
/// symbol terminate at the delivery price.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub symbol: Symbol,
    pub price: f64,
}

/// The event payload. Listener registration and dispatch key off the payload
/// kind exactly; there is no polymorphic dispatch over kinds.
#[derive(Clone, Debug)]
pub enum Payload {
    BookTicker(BookTicker),
    Trade(Trade),
    Funding(Funding),
    Delivery(Delivery),
    /// A periodic scheduler tick. Carries no payload beyond the header
    /// timestamp.
    Timer,
    Order(Order),
}

impl Payload {
    /// Returns the discriminant used for listener registration.
    #[inline]
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::BookTicker(_) => EventKind::BookTicker,
            Payload::Trade(_) => EventKind::Trade,
            Payload::Funding(_) => EventKind::Funding,
            Payload::Delivery(_) => EventKind::Delivery,
            Payload::Timer => EventKind::Timer,
            Payload::Order(_) => EventKind::Order,
        }
    }
}

/// Payload discriminant for exact-kind listener registration.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(usize)]
pub enum EventKind {
    BookTicker = 0,
    Trade = 1,
    Funding = 2,
    Delivery = 3,
    Timer = 4,
    Order = 5,
}

impl EventKind {
    pub(crate) const COUNT: usize = 6;
}

/// An event: a minimal header plus a payload.
///
/// The header is stamped by the first engine the event enters. `source` is the
/// identity of that engine, `producer` the identity of the listener that
/// emitted it, and both stay `0` until `put` assigns them.
#[derive(Clone, Debug)]
pub struct Event {
    pub timestamp: Timestamp,
    pub source: Identity,
    pub producer: Identity,
    pub payload: Payload,
}

impl Event {
    /// Constructs an event with an unset header. The receiving engine assigns
    /// the timestamp from its clock.
    pub fn new(payload: Payload) -> Self {
        Self {
            timestamp: 0,
            source: 0,
            producer: 0,
            payload,
        }
    }

    /// Constructs an event carrying its own timestamp, as dataset rows do.
    pub fn at(timestamp: Timestamp, payload: Payload) -> Self {
        Self {
            timestamp,
            source: 0,
            producer: 0,
            payload,
        }
    }

    /// Produces a copy with the header reset to zero and the payload
    /// preserved. A forwarded or re-emitted event must re-acquire its header
    /// without mutating the original observed by earlier listeners.
    pub fn derive(&self) -> Event {
        Event {
            timestamp: 0,
            source: 0,
            producer: 0,
            payload: self.payload.clone(),
        }
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Errors that can occur during backtesting.
#[derive(Error, Debug)]
pub enum BacktestError {
    /// The scheduler observed a candidate timestamp strictly below an engine
    /// clock. The run aborts because logical clocks must be monotone.
    #[error("time regression: candidate timestamp {candidate} precedes engine clock {clock}")]
    TimeRegression { candidate: Timestamp, clock: Timestamp },
    #[error("data error: {0:?}")]
    Data(#[from] IoError),
}

/// Provides errors that can occur in builders.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("`{0}` is required")]
    BuilderIncomplete(&'static str),
    #[error("{0}")]
    InvalidArgument(&'static str),
    #[error("{0:?}")]
    Error(#[from] anyhow::Error),
}
