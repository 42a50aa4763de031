use std::{cell::RefCell, rc::Rc};

use crate::{
    account::Account,
    backtest::{Component, RunContext},
    engine::EventEngine,
    order::{Order, OrderId, OrderIds, OrderState},
    types::{BacktestError, BookTicker, EventKind, Payload, Timestamp, Trade},
};

/// What a strategy sees of the run: order entry, the shadow account, and the
/// strategy-side clock.
#[derive(Clone)]
pub struct StrategyCtx {
    engine: EventEngine,
    pub account: Account,
    pub order_ids: OrderIds,
}

impl StrategyCtx {
    /// Submits an order created with [`Order::limit`], [`Order::market`], or
    /// [`Order::tracking`]. The order is stamped `Submitted` and travels to
    /// the matcher over the client-to-server bus.
    pub fn send(&self, mut order: Order) {
        debug_assert!(
            order.state == OrderState::Created || order.is_cancel(),
            "only freshly created orders can be sent"
        );
        if !order.is_cancel() {
            order.state = OrderState::Submitted;
        }
        self.engine.put(order.into_event());
    }

    /// Submits a cancel instruction for `target`.
    pub fn cancel(&self, symbol: crate::types::Symbol, target: OrderId) {
        self.send(Order::cancel(&self.order_ids, symbol, target));
    }

    /// Returns the strategy-side clock.
    pub fn timestamp(&self) -> Timestamp {
        self.engine.timestamp()
    }
}

/// Strategy hooks. Every hook has a default empty implementation, so a
/// strategy implements only what it reacts to.
///
/// Hooks run on the client engine; market data and order updates arrive
/// through the server-to-client bus and therefore lag the exchange by the
/// configured latency, the same way a live strategy would observe them.
pub trait Strategy {
    fn on_start(&mut self, _ctx: &StrategyCtx) {}

    fn on_book_ticker(&mut self, _ticker: &BookTicker, _ctx: &StrategyCtx) {}

    fn on_trade(&mut self, _trade: &Trade, _ctx: &StrategyCtx) {}

    fn on_timer(&mut self, _timestamp: Timestamp, _ctx: &StrategyCtx) {}

    /// Called for every order update the client observes, including the
    /// echoes of this strategy's own submissions.
    fn on_order(&mut self, _order: &Order, _ctx: &StrategyCtx) {}

    fn on_stop(&mut self) {}
}

/// Mounts a [`Strategy`] on the client engine.
pub struct StrategyComponent<S> {
    strategy: Rc<RefCell<S>>,
}

impl<S: Strategy + 'static> StrategyComponent<S> {
    pub fn new(strategy: S) -> Self {
        Self {
            strategy: Rc::new(RefCell::new(strategy)),
        }
    }
}

impl<S: Strategy + 'static> Component for StrategyComponent<S> {
    fn start(&mut self, ctx: &RunContext) -> Result<(), BacktestError> {
        let strategy_ctx = StrategyCtx {
            engine: ctx.engine.clone(),
            account: ctx.account.clone(),
            order_ids: ctx.order_ids.clone(),
        };
        self.strategy.borrow_mut().on_start(&strategy_ctx);

        let strategy = self.strategy.clone();
        let sctx = strategy_ctx.clone();
        ctx.engine.register(EventKind::BookTicker, true, move |ev| {
            if let Payload::BookTicker(ticker) = &ev.payload {
                strategy.borrow_mut().on_book_ticker(ticker, &sctx);
            }
        });

        let strategy = self.strategy.clone();
        let sctx = strategy_ctx.clone();
        ctx.engine.register(EventKind::Trade, true, move |ev| {
            if let Payload::Trade(trade) = &ev.payload {
                strategy.borrow_mut().on_trade(trade, &sctx);
            }
        });

        let strategy = self.strategy.clone();
        let sctx = strategy_ctx.clone();
        ctx.engine.register(EventKind::Timer, true, move |ev| {
            strategy.borrow_mut().on_timer(ev.timestamp, &sctx);
        });

        let strategy = self.strategy.clone();
        let sctx = strategy_ctx;
        ctx.engine.register(EventKind::Order, true, move |ev| {
            if let Payload::Order(order) = &ev.payload {
                strategy.borrow_mut().on_order(order, &sctx);
            }
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BacktestError> {
        self.strategy.borrow_mut().on_stop();
        Ok(())
    }
}
