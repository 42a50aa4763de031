//! Order matching against top-of-book snapshots and aggregated trade prints.
//!
//! The matcher decides when a resting order would have filled under
//! conservative maker assumptions: it never assumes a better queue position
//! than the displayed sizes support, and it never fills without evidence from
//! the feed.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
};

pub use book::{OrderBook, SideBook};
use tracing::{debug, warn};

use crate::{
    backtest::{Component, RunContext},
    engine::EventEngine,
    order::{OrdType, Order, OrderId, OrderState},
    types::{
        to_scaled, BacktestError, BookTicker, Delivery, EventKind, Payload, Side, Symbol, Trade,
        INVALID_MAX, INVALID_MIN,
    },
};

mod book;

/// Cached top of book for one symbol.
///
/// Snapshots set both prices and displayed sizes. Trade prints may move the
/// inferred best prices between snapshots; a size is `None` after such a move
/// because the displayed quantity at the new level is unobservable until the
/// next snapshot.
#[derive(Clone, Copy, Debug)]
struct Quote {
    bid_int: i64,
    ask_int: i64,
    bid_px: f64,
    ask_px: f64,
    bid_qty: Option<f64>,
    ask_qty: Option<f64>,
}

struct Matcher {
    maker_fee: f64,
    taker_fee: f64,
    books: HashMap<Symbol, OrderBook>,
    /// Resting orders by id. The order itself carries symbol, side, and price,
    /// so this map doubles as the O(1) cancel index.
    orders: HashMap<OrderId, Order>,
    /// Orders acknowledged before any snapshot existed for their symbol; they
    /// enter the book on the symbol's first snapshot.
    pending: HashMap<Symbol, VecDeque<Order>>,
    quotes: HashMap<Symbol, Quote>,
}

impl Matcher {
    fn new(maker_fee: f64, taker_fee: f64) -> Self {
        Self {
            maker_fee,
            taker_fee,
            books: HashMap::new(),
            orders: HashMap::new(),
            pending: HashMap::new(),
            quotes: HashMap::new(),
        }
    }

    fn on_order(&mut self, order: &Order, engine: &EventEngine) {
        if order.is_cancel() {
            let Some(target) = order.cancel_target_id else {
                warn!(order_id = order.order_id, "cancel without a target id");
                return;
            };
            self.cancel_order(target, engine);
            return;
        }
        if order.state != OrderState::Submitted {
            return;
        }
        debug_assert!(
            !self.orders.contains_key(&order.order_id),
            "order id resubmitted"
        );

        let mut accepted = order.clone();
        accepted.state = OrderState::Received;
        engine.put(accepted.clone().into_event());

        if self.quotes.contains_key(&accepted.symbol) {
            self.enter_order(accepted, engine);
        } else if accepted.order_type == OrdType::Market {
            // no reference price exists yet, so the fill price would be
            // fiction
            warn!(
                order_id = accepted.order_id,
                symbol = %accepted.symbol,
                "market order rejected: no book snapshot observed"
            );
        } else {
            self.pending
                .entry(accepted.symbol.clone())
                .or_default()
                .push_back(accepted);
        }
    }

    /// Processes an acknowledged order against the cached top of book:
    /// market orders take the opposite best, tracking orders peg to the
    /// own-side best and continue as limit orders, and limit orders either
    /// take or rest with their initial queue position.
    fn enter_order(&mut self, mut order: Order, engine: &EventEngine) {
        let Some(&quote) = self.quotes.get(&order.symbol) else {
            return;
        };

        match order.order_type {
            OrdType::Market => {
                let px = if order.quantity > 0.0 {
                    quote.ask_px
                } else {
                    quote.bid_px
                };
                self.emit_fill(order, px, true, engine);
                return;
            }
            OrdType::Tracking => {
                order.order_type = OrdType::Limit;
                order.price = Some(if order.quantity > 0.0 {
                    quote.bid_px
                } else {
                    quote.ask_px
                });
            }
            OrdType::Limit => {}
            OrdType::Cancel => return,
        }

        let Some(price_int) = order.price_int() else {
            warn!(order_id = order.order_id, "limit order rejected: no price");
            return;
        };

        if order.quantity > 0.0 {
            if price_int >= quote.ask_int {
                self.emit_fill(order, quote.ask_px, true, engine);
                return;
            }
            order.rank = if price_int == quote.bid_int {
                quote.bid_qty
            } else if price_int > quote.bid_int {
                Some(0.0)
            } else {
                None
            };
        } else {
            if price_int <= quote.bid_int {
                self.emit_fill(order, quote.bid_px, true, engine);
                return;
            }
            order.rank = if price_int == quote.ask_int {
                quote.ask_qty
            } else if price_int < quote.ask_int {
                Some(0.0)
            } else {
                None
            };
        }
        order.traded = 0.0;

        let book = self.books.entry(order.symbol.clone()).or_default();
        book.side_mut(order.side()).insert(price_int, order.order_id);
        self.orders.insert(order.order_id, order);
    }

    fn on_book_ticker(&mut self, ticker: &BookTicker, engine: &EventEngine) {
        let quote = Quote {
            bid_int: to_scaled(ticker.bid_price),
            ask_int: to_scaled(ticker.ask_price),
            bid_px: ticker.bid_price,
            ask_px: ticker.ask_price,
            bid_qty: Some(ticker.bid_qty),
            ask_qty: Some(ticker.ask_qty),
        };

        self.maintain_side(&ticker.symbol, Side::Buy, quote, engine);
        self.maintain_side(&ticker.symbol, Side::Sell, quote, engine);

        self.quotes.insert(ticker.symbol.clone(), quote);
        self.flush_pending(&ticker.symbol, engine);
    }

    /// Walks one side's resting levels against a new snapshot and applies the
    /// queue-position rules per level. For a buy order at price `p`:
    /// the opposite best stepping through `p` fills it at its own price;
    /// landing strictly inside the new spread means it is alone at a new best
    /// (`rank = 0`); sitting exactly at the new best updates the rank with a
    /// front-cancel estimate; resting deeper than the visible level makes the
    /// position unobservable (`rank = None`). Sells mirror.
    fn maintain_side(&mut self, symbol: &Symbol, side: Side, quote: Quote, engine: &EventEngine) {
        let Some(book) = self.books.get(symbol) else {
            return;
        };
        let prices = match side {
            Side::Buy => book.bids.prices(),
            Side::Sell => book.asks.prices(),
        };
        let (own_int, own_qty, opp_int) = match side {
            Side::Buy => (quote.bid_int, quote.bid_qty, quote.ask_int),
            Side::Sell => (quote.ask_int, quote.ask_qty, quote.bid_int),
        };

        for price_int in prices {
            let ids = match self.books.get(symbol) {
                Some(book) => match side {
                    Side::Buy => book.bids.ids_at(price_int),
                    Side::Sell => book.asks.ids_at(price_int),
                },
                None => return,
            };
            let crossed = match side {
                Side::Buy => opp_int <= price_int,
                Side::Sell => opp_int >= price_int,
            };
            let inside = match side {
                Side::Buy => own_int < price_int,
                Side::Sell => own_int > price_int,
            };
            if crossed {
                // the opposite side stepped through the order
                for id in ids {
                    self.fill_resting(id, engine);
                }
            } else if inside {
                for id in ids {
                    if let Some(order) = self.orders.get_mut(&id) {
                        order.rank = Some(0.0);
                        order.traded = 0.0;
                    }
                }
            } else if price_int == own_int {
                for id in ids {
                    let filled = match self.orders.get_mut(&id) {
                        Some(order) => match (order.rank, own_qty) {
                            (Some(rank), Some(displayed)) => {
                                // the size decrease not explained by observed
                                // trades is attributed to cancels ahead of the
                                // order, bounded so it cannot jump the queue
                                let front_cancel =
                                    (rank - order.traded - displayed).max(0.0);
                                let new_rank = rank - order.traded - front_cancel;
                                order.rank = Some(new_rank);
                                order.traded = 0.0;
                                new_rank < 0.0
                            }
                            (_, displayed) => {
                                order.rank = displayed;
                                order.traded = 0.0;
                                false
                            }
                        },
                        None => false,
                    };
                    if filled {
                        self.fill_resting(id, engine);
                    }
                }
            } else {
                // deeper than the visible level; queue position is no longer
                // observable
                for id in ids {
                    if let Some(order) = self.orders.get_mut(&id) {
                        order.rank = None;
                        order.traded = 0.0;
                    }
                }
            }
        }
    }

    fn on_trade(&mut self, trade: &Trade, engine: &EventEngine) {
        let price_int = to_scaled(trade.price);

        // A print is evidence about the quote between snapshots: a taker-sell
        // price is the bid, a taker-buy price is the ask, and a crossed
        // opposite best gets pulled along. A moved best has an unknown
        // displayed size until the next snapshot.
        if let Some(quote) = self.quotes.get_mut(&trade.symbol) {
            match trade.side {
                Side::Sell => {
                    if quote.bid_int != price_int {
                        quote.bid_int = price_int;
                        quote.bid_px = trade.price;
                        quote.bid_qty = None;
                    }
                    if quote.ask_int < price_int {
                        quote.ask_int = price_int;
                        quote.ask_px = trade.price;
                        quote.ask_qty = None;
                    }
                }
                Side::Buy => {
                    if quote.ask_int != price_int {
                        quote.ask_int = price_int;
                        quote.ask_px = trade.price;
                        quote.ask_qty = None;
                    }
                    if quote.bid_int > price_int {
                        quote.bid_int = price_int;
                        quote.bid_px = trade.price;
                        quote.bid_qty = None;
                    }
                }
            }
        }

        self.match_trade_side(&trade.symbol, Side::Buy, price_int, trade, engine);
        self.match_trade_side(&trade.symbol, Side::Sell, price_int, trade, engine);
    }

    /// Matches one side's resting orders against a print. Buy orders strictly
    /// above the trade price were traded through and fill at their own price.
    /// Buy orders at the trade price advance only when the taker was a seller
    /// (the bid side was consumed); they fill once the observed executed size
    /// exceeds the size that was ahead of them. A taker on the same side hit
    /// the opposite quote and leaves them untouched. Sells mirror.
    fn match_trade_side(
        &mut self,
        symbol: &Symbol,
        side: Side,
        price_int: i64,
        trade: &Trade,
        engine: &EventEngine,
    ) {
        // levels traded through; the extremum cache refreshes as buckets empty
        loop {
            let best = match self.books.get(symbol) {
                Some(book) => match side {
                    Side::Buy => book.bids.best(),
                    Side::Sell => book.asks.best(),
                },
                None => return,
            };
            let through = match side {
                Side::Buy => best != INVALID_MIN && best > price_int,
                Side::Sell => best != INVALID_MAX && best < price_int,
            };
            if !through {
                break;
            }
            let ids = match side {
                Side::Buy => self.books[symbol].bids.ids_at(best),
                Side::Sell => self.books[symbol].asks.ids_at(best),
            };
            for id in ids {
                self.fill_resting(id, engine);
            }
        }

        // queue consumption at the trade price
        let consumed = trade.side != side;
        if !consumed {
            return;
        }
        let Some(book) = self.books.get(symbol) else {
            return;
        };
        let at_price = match side {
            Side::Buy => book.bids.best() == price_int,
            Side::Sell => book.asks.best() == price_int,
        };
        if !at_price {
            return;
        }
        let ids = match side {
            Side::Buy => book.bids.ids_at(price_int),
            Side::Sell => book.asks.ids_at(price_int),
        };
        for id in ids {
            let filled = match self.orders.get_mut(&id) {
                Some(order) => match order.rank {
                    Some(rank) => {
                        order.traded += trade.qty;
                        order.traded > rank
                    }
                    // position unobservable; no fill without evidence
                    None => false,
                },
                None => false,
            };
            if filled {
                self.fill_resting(id, engine);
            }
        }
    }

    fn cancel_order(&mut self, target: OrderId, engine: &EventEngine) {
        if self.orders.contains_key(&target) {
            let Some(mut order) = self.unrest(target) else {
                return;
            };
            order.state = OrderState::Canceled;
            debug!(order_id = target, "order canceled");
            engine.put(order.into_event());
            return;
        }
        for queue in self.pending.values_mut() {
            if let Some(pos) = queue.iter().position(|order| order.order_id == target) {
                let mut order = queue.remove(pos).expect("position just found");
                order.state = OrderState::Canceled;
                debug!(order_id = target, "pending order canceled");
                engine.put(order.into_event());
                return;
            }
        }
        // already filled, already canceled, or never received; cancels are
        // idempotent
        debug!(order_id = target, "cancel target not found");
    }

    /// Delivery terminates the contract: every resting and pending order for
    /// the symbol is dropped without individual cancel acknowledgments, since
    /// the delivery event itself communicates the termination.
    fn on_delivery(&mut self, delivery: &Delivery) {
        self.pending.remove(&delivery.symbol);
        self.quotes.remove(&delivery.symbol);
        if let Some(book) = self.books.remove(&delivery.symbol) {
            for id in book.all_ids() {
                self.orders.remove(&id);
            }
            debug!(symbol = %delivery.symbol, "book cleared on delivery");
        }
    }

    fn flush_pending(&mut self, symbol: &Symbol, engine: &EventEngine) {
        let Some(mut queue) = self.pending.remove(symbol) else {
            return;
        };
        while let Some(order) = queue.pop_front() {
            self.enter_order(order, engine);
        }
    }

    /// Removes a resting order from the book and the id index.
    fn unrest(&mut self, order_id: OrderId) -> Option<Order> {
        let order = self.orders.remove(&order_id)?;
        if let (Some(price_int), Some(book)) =
            (order.price_int(), self.books.get_mut(&order.symbol))
        {
            book.side_mut(order.side()).remove(price_int, order_id);
        }
        Some(order)
    }

    /// Fills a resting order at its own price with the maker fee.
    fn fill_resting(&mut self, order_id: OrderId, engine: &EventEngine) {
        let Some(order) = self.unrest(order_id) else {
            return;
        };
        let price = order.price.unwrap_or_default();
        self.emit_fill(order, price, false, engine);
    }

    /// Emits the FILLED transition. The resting entry is already removed when
    /// this runs, so a listener reacting to the fill observes a consistent
    /// book.
    fn emit_fill(&mut self, mut order: Order, filled_price: f64, is_taker: bool, engine: &EventEngine) {
        order.state = OrderState::Filled;
        order.filled_price = filled_price;
        let rate = if is_taker { self.taker_fee } else { self.maker_fee };
        order.commission_fee = (filled_price * order.quantity).abs() * rate;
        debug!(
            order_id = order.order_id,
            symbol = %order.symbol,
            price = filled_price,
            qty = order.quantity,
            maker = !is_taker,
            "order filled"
        );
        engine.put(order.into_event());
    }
}

/// The order matching engine component. Mounted on the server engine; listens
/// for market data and inbound orders and emits order state transitions.
pub struct MatchEngine {
    inner: Rc<RefCell<Matcher>>,
}

impl MatchEngine {
    /// Constructs a `MatchEngine` with the given fee rates. Fees are charged
    /// on the traded value: passive fills pay `maker_fee`, aggressing fills
    /// pay `taker_fee`.
    pub fn new(maker_fee: f64, taker_fee: f64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Matcher::new(maker_fee, taker_fee))),
        }
    }
}

impl Component for MatchEngine {
    fn start(&mut self, ctx: &RunContext) -> Result<(), BacktestError> {
        let inner = self.inner.clone();
        let engine = ctx.engine.clone();
        ctx.engine.register(EventKind::Order, true, move |ev| {
            if let Payload::Order(order) = &ev.payload {
                inner.borrow_mut().on_order(order, &engine);
            }
        });

        let inner = self.inner.clone();
        let engine = ctx.engine.clone();
        ctx.engine.register(EventKind::BookTicker, true, move |ev| {
            if let Payload::BookTicker(ticker) = &ev.payload {
                inner.borrow_mut().on_book_ticker(ticker, &engine);
            }
        });

        let inner = self.inner.clone();
        let engine = ctx.engine.clone();
        ctx.engine.register(EventKind::Trade, true, move |ev| {
            if let Payload::Trade(trade) = &ev.payload {
                inner.borrow_mut().on_trade(trade, &engine);
            }
        });

        let inner = self.inner.clone();
        ctx.engine.register(EventKind::Delivery, true, move |ev| {
            if let Payload::Delivery(delivery) = &ev.payload {
                inner.borrow_mut().on_delivery(delivery);
            }
        });
        Ok(())
    }
}
