use std::{cell::Cell, rc::Rc};

use crate::types::{to_scaled, Event, Payload, Side, Symbol};

pub type OrderId = u64;

/// Order type.
///
/// A cancel instruction travels as an order message but does not participate
/// in the order state machine; it only carries the target order id.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum OrdType {
    /// Limit order; requires a price.
    Limit = 0,
    /// Market order; fills at the opposite best on arrival.
    Market = 1,
    /// Pegged to the own-side best quote; converted to a limit order at entry.
    Tracking = 2,
    /// Cancel instruction for a previously submitted order.
    Cancel = 3,
}

impl AsRef<str> for OrdType {
    fn as_ref(&self) -> &'static str {
        match self {
            OrdType::Limit => "LIMIT",
            OrdType::Market => "MARKET",
            OrdType::Tracking => "TRACKING",
            OrdType::Cancel => "CANCEL",
        }
    }
}

/// Order lifecycle state.
///
/// ```text
/// Created --(send)--> Submitted --(accept)--> Received --+--> Filled
///                                                        +--> Canceled
/// ```
///
/// `Filled` and `Canceled` are terminal; an order never re-enters a
/// non-terminal state from either.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum OrderState {
    Created = 0,
    Submitted = 1,
    Received = 2,
    Filled = 3,
    Canceled = 4,
}

impl OrderState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Canceled)
    }
}

/// An order message.
///
/// `quantity` is signed: positive buys, negative sells; the magnitude is the
/// size. `rank` and `traded` reconstruct the maker-queue position while the
/// order rests in the book: `rank` is the size still ahead of the order at its
/// price level as of the last snapshot (`None` while the position is not
/// observable), and `traded` accumulates the size executed at the level since
/// then.
#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    /// Unique within a run and stable across [`Event::derive`].
    pub order_id: OrderId,
    pub order_type: OrdType,
    pub symbol: Symbol,
    pub quantity: f64,
    /// `None` for market and tracking orders.
    pub price: Option<f64>,
    pub state: OrderState,
    /// Target order id; only meaningful on a cancel instruction.
    pub cancel_target_id: Option<OrderId>,
    pub rank: Option<f64>,
    pub traded: f64,
    /// Execution price, populated on fill.
    pub filled_price: f64,
    /// Commission charged on fill.
    pub commission_fee: f64,
}

impl Order {
    fn base(order_id: OrderId, order_type: OrdType, symbol: Symbol, quantity: f64) -> Self {
        Self {
            order_id,
            order_type,
            symbol,
            quantity,
            price: None,
            state: OrderState::Created,
            cancel_target_id: None,
            rank: None,
            traded: 0.0,
            filled_price: 0.0,
            commission_fee: 0.0,
        }
    }

    /// Constructs a limit order.
    pub fn limit(ids: &OrderIds, symbol: Symbol, quantity: f64, price: f64) -> Self {
        let mut order = Self::base(ids.next_id(), OrdType::Limit, symbol, quantity);
        order.price = Some(price);
        order
    }

    /// Constructs a market order.
    pub fn market(ids: &OrderIds, symbol: Symbol, quantity: f64) -> Self {
        Self::base(ids.next_id(), OrdType::Market, symbol, quantity)
    }

    /// Constructs a tracking order pegged to the own-side best quote.
    pub fn tracking(ids: &OrderIds, symbol: Symbol, quantity: f64) -> Self {
        Self::base(ids.next_id(), OrdType::Tracking, symbol, quantity)
    }

    /// Constructs a cancel instruction for `target`.
    pub fn cancel(ids: &OrderIds, symbol: Symbol, target: OrderId) -> Self {
        let mut order = Self::base(ids.next_id(), OrdType::Cancel, symbol, 0.0);
        order.cancel_target_id = Some(target);
        order
    }

    #[inline]
    pub fn is_cancel(&self) -> bool {
        self.order_type == OrdType::Cancel
    }

    /// Returns the order side, derived from the quantity sign.
    #[inline]
    pub fn side(&self) -> Side {
        if self.quantity >= 0.0 {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    /// Returns the price in scaled-integer units, or `None` when the order
    /// carries no price. The integer is computed from the float on demand so a
    /// reassigned price can never leave a stale cache behind.
    #[inline]
    pub fn price_int(&self) -> Option<i64> {
        self.price.map(to_scaled)
    }

    /// Returns the signed quantity in scaled-integer units.
    #[inline]
    pub fn quantity_int(&self) -> i64 {
        to_scaled(self.quantity)
    }

    /// Wraps this order in an event with an unset header.
    pub fn into_event(self) -> Event {
        Event::new(Payload::Order(self))
    }
}

/// Run-scoped order id generator.
///
/// One generator is owned by the backtest and handles are cloned into every
/// component that creates orders, so ids are monotone and unique within a run
/// without any global state. Cloning shares the underlying counter.
#[derive(Clone, Debug)]
pub struct OrderIds {
    next: Rc<Cell<OrderId>>,
}

impl OrderIds {
    pub fn new() -> Self {
        // id 0 is reserved so that "no order" stays representable
        Self {
            next: Rc::new(Cell::new(1)),
        }
    }

    /// Returns the next order id.
    pub fn next_id(&self) -> OrderId {
        let id = self.next.get();
        self.next.set(id + 1);
        id
    }
}

impl Default for OrderIds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    fn symbol() -> Symbol {
        Rc::from("ETH-USDT")
    }

    #[test]
    fn ids_are_monotone_and_shared() {
        let ids = OrderIds::new();
        let clone = ids.clone();
        let a = Order::limit(&ids, symbol(), 1.0, 10.0);
        let b = Order::market(&clone, symbol(), -1.0);
        assert!(b.order_id > a.order_id);
        assert_ne!(a.order_id, 0);
    }

    #[test]
    fn side_follows_quantity_sign() {
        let ids = OrderIds::new();
        assert_eq!(Order::limit(&ids, symbol(), 2.0, 10.0).side(), Side::Buy);
        assert_eq!(Order::limit(&ids, symbol(), -2.0, 10.0).side(), Side::Sell);
    }

    #[test]
    fn scaled_accessors() {
        let ids = OrderIds::new();
        let mut order = Order::limit(&ids, symbol(), -0.5, 100.2);
        assert_eq!(order.price_int(), Some(10_020_000_000));
        assert_eq!(order.quantity_int(), -50_000_000);
        // reassignment is reflected immediately
        order.price = Some(100.3);
        assert_eq!(order.price_int(), Some(10_030_000_000));
        assert_eq!(Order::market(&ids, symbol(), 1.0).price_int(), None);
    }

    #[test]
    fn cancel_carries_target() {
        let ids = OrderIds::new();
        let target = Order::limit(&ids, symbol(), 1.0, 10.0);
        let cancel = Order::cancel(&ids, symbol(), target.order_id);
        assert!(cancel.is_cancel());
        assert_eq!(cancel.cancel_target_id, Some(target.order_id));
    }
}
