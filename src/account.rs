use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::Rc,
};

use tracing::debug;

use crate::{
    backtest::{Component, RunContext},
    order::{Order, OrderId, OrderState},
    types::{from_scaled, BacktestError, Delivery, EventKind, Funding, Payload, Symbol, Trade},
};

/// Cumulative per-symbol statistics, kept for snapshot differencing.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SymbolStats {
    /// Total traded value.
    pub turnover: f64,
    pub commission: f64,
    pub funding_fee: f64,
    /// Signed cash generated by fills and delivery close-outs.
    pub net_cash_flow: f64,
    pub trade_count: u64,
}

#[derive(Default)]
struct AccountInner {
    cash_balance: f64,
    /// Positions in scaled-integer units; an exact zero removes the key, so
    /// float drift can never leave a phantom position behind.
    positions: HashMap<Symbol, i64>,
    orders: HashMap<OrderId, Order>,
    last_price: HashMap<Symbol, f64>,
    stats: HashMap<Symbol, SymbolStats>,
    /// Order ids that reached a terminal state. A late acknowledgment for one
    /// of these must not resurrect the order.
    terminal: HashSet<OrderId>,
}

impl AccountInner {
    fn on_order(&mut self, order: &Order) {
        if order.is_cancel() {
            return;
        }
        if self.terminal.contains(&order.order_id) {
            return;
        }
        match order.state {
            OrderState::Created | OrderState::Submitted | OrderState::Received => {
                self.orders.insert(order.order_id, order.clone());
            }
            OrderState::Filled => {
                let symbol = order.symbol.clone();
                let stats = self.stats.entry(symbol.clone()).or_default();
                stats.turnover += (order.quantity * order.filled_price).abs();
                stats.commission += order.commission_fee;
                stats.trade_count += 1;

                // buy spends cash, sell raises it
                let cash_flow = -order.quantity * order.filled_price;
                stats.net_cash_flow += cash_flow;
                self.cash_balance += cash_flow;
                self.cash_balance -= order.commission_fee;

                let position = self.positions.entry(symbol.clone()).or_insert(0);
                *position += order.quantity_int();
                if *position == 0 {
                    self.positions.remove(&symbol);
                }

                self.orders.remove(&order.order_id);
                self.terminal.insert(order.order_id);
            }
            OrderState::Canceled => {
                self.orders.remove(&order.order_id);
                self.terminal.insert(order.order_id);
            }
        }
    }

    fn on_trade(&mut self, trade: &Trade) {
        self.last_price.insert(trade.symbol.clone(), trade.price);
    }

    fn on_funding(&mut self, funding: &Funding) {
        let Some(&position) = self.positions.get(&funding.symbol) else {
            return;
        };
        let fee = from_scaled(position) * funding.mark_price * funding.funding_rate;
        self.cash_balance -= fee;
        self.stats.entry(funding.symbol.clone()).or_default().funding_fee += fee;
        debug!(symbol = %funding.symbol, fee, "funding settled");
    }

    fn on_delivery(&mut self, delivery: &Delivery) {
        let Some(position) = self.positions.remove(&delivery.symbol) else {
            self.drop_orders_for(&delivery.symbol);
            return;
        };
        // a close-out is a forced opposite trade at the delivery price
        let cash_flow = from_scaled(position) * delivery.price;
        self.cash_balance += cash_flow;
        self.stats
            .entry(delivery.symbol.clone())
            .or_default()
            .net_cash_flow += cash_flow;
        debug!(symbol = %delivery.symbol, cash_flow, "position delivered");
        self.drop_orders_for(&delivery.symbol);
    }

    fn drop_orders_for(&mut self, symbol: &Symbol) {
        self.orders.retain(|_, order| &order.symbol != symbol);
    }

    fn position_value(&self) -> f64 {
        self.positions
            .iter()
            .map(|(symbol, &position)| {
                from_scaled(position) * self.last_price.get(symbol).copied().unwrap_or(0.0)
            })
            .sum()
    }
}

/// Account bookkeeping driven by fills, funding, and delivery events.
///
/// The account is a cheap-clone handle over shared state so strategies and
/// recorders can query it while it stays mounted on an engine as a component.
/// Within a run the server-side instance is authoritative; the client-side
/// instance is a shadow updated by the delayed event stream.
///
/// The balance identity holds at every point between events:
/// `equity == cash_balance + Σ position * last_price`.
#[derive(Clone)]
pub struct Account {
    inner: Rc<RefCell<AccountInner>>,
}

impl Account {
    /// Constructs an `Account` with an initial cash balance.
    pub fn new(initial_balance: f64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(AccountInner {
                cash_balance: initial_balance,
                ..Default::default()
            })),
        }
    }

    /// Returns the positions as floats, keyed by symbol.
    pub fn positions(&self) -> HashMap<Symbol, f64> {
        self.inner
            .borrow()
            .positions
            .iter()
            .map(|(symbol, &position)| (symbol.clone(), from_scaled(position)))
            .collect()
    }

    /// Returns the position for `symbol`, `0.0` when flat.
    pub fn position(&self, symbol: &str) -> f64 {
        self.inner
            .borrow()
            .positions
            .get(symbol)
            .copied()
            .map(from_scaled)
            .unwrap_or(0.0)
    }

    /// Returns the active orders, keyed by order id.
    pub fn orders(&self) -> HashMap<OrderId, Order> {
        self.inner.borrow().orders.clone()
    }

    /// Returns the last trade price for `symbol`, if one has been observed.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.inner.borrow().last_price.get(symbol).copied()
    }

    /// Returns the last trade prices, keyed by symbol.
    pub fn prices(&self) -> HashMap<Symbol, f64> {
        self.inner.borrow().last_price.clone()
    }

    /// Returns the cash balance.
    pub fn balance(&self) -> f64 {
        self.inner.borrow().cash_balance
    }

    /// Returns the equity: cash balance plus the mark-to-market value of the
    /// open positions.
    pub fn equity(&self) -> f64 {
        let inner = self.inner.borrow();
        inner.cash_balance + inner.position_value()
    }

    /// Returns the total absolute position value.
    pub fn total_margin(&self) -> f64 {
        let inner = self.inner.borrow();
        inner
            .positions
            .iter()
            .map(|(symbol, &position)| {
                from_scaled(position).abs() * inner.last_price.get(symbol).copied().unwrap_or(0.0)
            })
            .sum()
    }

    /// Returns margin over equity, or `None` when the equity is zero.
    pub fn leverage(&self) -> Option<f64> {
        let equity = self.equity();
        if equity == 0.0 {
            None
        } else {
            Some(self.total_margin() / equity)
        }
    }

    /// Returns the cumulative statistics for `symbol`.
    pub fn stats(&self, symbol: &str) -> SymbolStats {
        self.inner
            .borrow()
            .stats
            .get(symbol)
            .copied()
            .unwrap_or_default()
    }

    pub fn total_turnover(&self) -> f64 {
        self.inner.borrow().stats.values().map(|s| s.turnover).sum()
    }

    pub fn total_commission(&self) -> f64 {
        self.inner.borrow().stats.values().map(|s| s.commission).sum()
    }

    pub fn total_funding_fee(&self) -> f64 {
        self.inner
            .borrow()
            .stats
            .values()
            .map(|s| s.funding_fee)
            .sum()
    }

    pub fn total_trade_count(&self) -> u64 {
        self.inner
            .borrow()
            .stats
            .values()
            .map(|s| s.trade_count)
            .sum()
    }

    /// Returns the total trading profit: realized cash flows plus the value
    /// of the open positions, fees excluded.
    pub fn total_trade_pnl(&self) -> f64 {
        let inner = self.inner.borrow();
        let realized: f64 = inner.stats.values().map(|s| s.net_cash_flow).sum();
        realized + inner.position_value()
    }
}

impl Component for Account {
    fn start(&mut self, ctx: &RunContext) -> Result<(), BacktestError> {
        let inner = self.inner.clone();
        ctx.engine.register(EventKind::Order, true, move |ev| {
            if let Payload::Order(order) = &ev.payload {
                inner.borrow_mut().on_order(order);
            }
        });

        let inner = self.inner.clone();
        ctx.engine.register(EventKind::Trade, true, move |ev| {
            if let Payload::Trade(trade) = &ev.payload {
                inner.borrow_mut().on_trade(trade);
            }
        });

        let inner = self.inner.clone();
        ctx.engine.register(EventKind::Funding, true, move |ev| {
            if let Payload::Funding(funding) = &ev.payload {
                inner.borrow_mut().on_funding(funding);
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
