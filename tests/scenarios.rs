//! End-to-end runs through the full wiring: dataset, scheduler, both delay
//! buses, matcher, accounts, and a strategy on the client side.

use std::{cell::RefCell, rc::Rc};

use tickbt::prelude::*;

const DELAY: Timestamp = 10;
const MAKER: f64 = 1.1e-4;
const TAKER: f64 = 2e-4;

fn symbol() -> Symbol {
    Rc::from("BTC-USDT")
}

fn ticker(ts: Timestamp, bid: f64, bid_qty: f64, ask: f64, ask_qty: f64) -> Event {
    Event::at(
        ts,
        Payload::BookTicker(BookTicker {
            symbol: symbol(),
            bid_price: bid,
            bid_qty,
            ask_price: ask,
            ask_qty,
        }),
    )
}

fn trade(ts: Timestamp, price: f64, qty: f64, side: Side) -> Event {
    Event::at(
        ts,
        Payload::Trade(Trade {
            symbol: symbol(),
            price,
            qty,
            side,
        }),
    )
}

fn delivery(ts: Timestamp, price: f64) -> Event {
    Event::at(
        ts,
        Payload::Delivery(Delivery {
            symbol: symbol(),
            price,
        }),
    )
}

/// Submits a scripted list of orders, one per observed book ticker, and
/// records every order update the client sees.
struct Scripted {
    orders: Vec<Order>,
    updates: Rc<RefCell<Vec<Order>>>,
}

impl Scripted {
    fn new(orders: Vec<Order>) -> (Self, Rc<RefCell<Vec<Order>>>) {
        let updates = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                orders,
                updates: updates.clone(),
            },
            updates,
        )
    }
}

impl Strategy for Scripted {
    fn on_book_ticker(&mut self, _ticker: &BookTicker, ctx: &StrategyCtx) {
        if !self.orders.is_empty() {
            ctx.send(self.orders.remove(0));
        }
    }

    fn on_order(&mut self, order: &Order, ctx: &StrategyCtx) {
        let _ = ctx;
        self.updates.borrow_mut().push(order.clone());
    }
}

fn fills_of(updates: &Rc<RefCell<Vec<Order>>>) -> Vec<Order> {
    updates
        .borrow()
        .iter()
        .filter(|o| o.state == OrderState::Filled)
        .cloned()
        .collect()
}

#[test]
fn immediate_taker_fill() {
    let ids = OrderIds::new();
    let (strategy, updates) =
        Scripted::new(vec![Order::limit(&ids, symbol(), 1.0, 100.3)]);

    let mut bt = BacktestEngine::builder()
        .add_data(Box::new(VecDataset::new(vec![ticker(
            100, 100.0, 10.0, 100.2, 10.0,
        )])))
        .latency_model(Box::new(ConstantLatency::new(DELAY)))
        .fees(MAKER, TAKER)
        .strategy(strategy)
        .build()
        .unwrap();
    bt.run().unwrap();

    let fills = fills_of(&updates);
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].filled_price, 100.2);
    assert!((fills[0].commission_fee - 100.2 * TAKER).abs() < 1e-12);

    // authoritative account agrees with the shadow
    assert_eq!(bt.server_account().position("BTC-USDT"), 1.0);
    assert_eq!(bt.client_account().position("BTC-USDT"), 1.0);
}

#[test]
fn maker_fill_by_queue_exhaustion() {
    let ids = OrderIds::new();
    let (strategy, updates) =
        Scripted::new(vec![Order::limit(&ids, symbol(), 1.0, 100.0)]);

    // the order reaches the matcher at t=120; the prints land after it rests
    let mut bt = BacktestEngine::builder()
        .add_data(Box::new(VecDataset::new(vec![
            ticker(100, 100.0, 10.0, 100.2, 10.0),
            trade(130, 100.0, 6.0, Side::Sell),
            trade(140, 100.0, 5.0, Side::Sell),
        ])))
        .latency_model(Box::new(ConstantLatency::new(DELAY)))
        .fees(MAKER, TAKER)
        .strategy(strategy)
        .build()
        .unwrap();
    bt.run().unwrap();

    let fills = fills_of(&updates);
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].filled_price, 100.0);
    assert!((fills[0].commission_fee - 100.0 * MAKER).abs() < 1e-12);

    // one fill only: the first print left the order queued
    let states: Vec<OrderState> = updates
        .borrow()
        .iter()
        .filter(|o| o.order_id == fills[0].order_id)
        .map(|o| o.state)
        .collect();
    assert_eq!(
        states,
        vec![OrderState::Submitted, OrderState::Received, OrderState::Filled]
    );
}

#[test]
fn cancel_before_fill() {
    struct CancelAfterRest {
        sent: Option<OrderId>,
        updates: Rc<RefCell<Vec<Order>>>,
    }

    impl Strategy for CancelAfterRest {
        fn on_book_ticker(&mut self, _ticker: &BookTicker, ctx: &StrategyCtx) {
            if self.sent.is_none() {
                let order = Order::limit(&ctx.order_ids, Rc::from("BTC-USDT"), 1.0, 100.0);
                self.sent = Some(order.order_id);
                ctx.send(order);
            }
        }

        fn on_order(&mut self, order: &Order, ctx: &StrategyCtx) {
            self.updates.borrow_mut().push(order.clone());
            // cancel on the acknowledgment
            if order.state == OrderState::Received && Some(order.order_id) == self.sent {
                ctx.cancel(order.symbol.clone(), order.order_id);
            }
        }
    }

    let updates = Rc::new(RefCell::new(Vec::new()));
    let strategy = CancelAfterRest {
        sent: None,
        updates: updates.clone(),
    };

    // the print at the order's level arrives after the cancel and must not
    // resurrect it
    let mut bt = BacktestEngine::builder()
        .add_data(Box::new(VecDataset::new(vec![
            ticker(100, 100.0, 10.0, 100.2, 10.0),
            trade(200, 100.0, 50.0, Side::Sell),
        ])))
        .latency_model(Box::new(ConstantLatency::new(DELAY)))
        .fees(MAKER, TAKER)
        .strategy(strategy)
        .build()
        .unwrap();
    bt.run().unwrap();

    let states: Vec<OrderState> = updates.borrow().iter().map(|o| o.state).collect();
    assert!(states.contains(&OrderState::Canceled));
    assert!(!states.contains(&OrderState::Filled));
    assert!(bt.server_account().positions().is_empty());
    assert!(bt.server_account().orders().is_empty());
}

#[test]
fn delivery_closes_position() {
    let ids = OrderIds::new();
    let (strategy, updates) = Scripted::new(vec![Order::market(&ids, symbol(), 2.0)]);

    let mut bt = BacktestEngine::builder()
        .add_data(Box::new(VecDataset::new(vec![
            ticker(100, 49_999.0, 5.0, 50_000.0, 5.0),
            trade(200, 50_500.0, 1.0, Side::Buy),
            delivery(300, 52_000.0),
        ])))
        .latency_model(Box::new(ConstantLatency::new(DELAY)))
        .fees(0.0, 0.0)
        .strategy(strategy)
        .build()
        .unwrap();
    bt.run().unwrap();

    let fills = fills_of(&updates);
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].filled_price, 50_000.0);

    let account = bt.server_account();
    assert!(account.positions().is_empty());
    // bought 2 at 50k, delivered at 52k
    assert!((account.balance() - (2.0 * 52_000.0 - 2.0 * 50_000.0)).abs() < 1e-9);
    assert!((account.stats("BTC-USDT").net_cash_flow - 4_000.0).abs() < 1e-9);
}

#[test]
fn delay_bus_ordering_at_equal_instants() {
    struct TimerSender {
        sent: bool,
    }

    impl Strategy for TimerSender {
        fn on_timer(&mut self, _timestamp: Timestamp, ctx: &StrategyCtx) {
            if !self.sent {
                self.sent = true;
                ctx.send(Order::limit(&ctx.order_ids, Rc::from("BTC-USDT"), 1.0, 99.0));
            }
        }
    }

    /// Observes the server engine: records each event kind with the server
    /// clock at dispatch.
    struct ServerSpy {
        seen: Rc<RefCell<Vec<(EventKind, Timestamp)>>>,
    }

    impl Component for ServerSpy {
        fn start(&mut self, ctx: &RunContext) -> Result<(), BacktestError> {
            let seen = self.seen.clone();
            let engine = ctx.engine.clone();
            ctx.engine.register_global(false, true, move |ev| {
                seen.borrow_mut().push((ev.kind(), engine.timestamp()));
            });
            Ok(())
        }
    }

    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut bt = BacktestEngine::builder()
        .add_data(Box::new(VecDataset::new(vec![
            ticker(100, 100.0, 10.0, 100.2, 10.0),
        ])))
        .latency_model(Box::new(ConstantLatency::new(DELAY)))
        .fees(MAKER, TAKER)
        .timer_interval(1_000)
        .strategy(TimerSender { sent: false })
        .server_component(Box::new(ServerSpy { seen: seen.clone() }))
        .build()
        .unwrap();
    bt.run().unwrap();

    let seen = seen.borrow();
    let data_pos = seen
        .iter()
        .position(|(kind, _)| *kind == EventKind::BookTicker)
        .expect("server saw the snapshot");
    let order_pos = seen
        .iter()
        .position(|(kind, _)| *kind == EventKind::Order)
        .expect("server saw the order");

    // the order was submitted at client time 100 but crosses the bus: the
    // matcher sees the t=100 market data strictly before it, at t=110
    assert!(data_pos < order_pos);
    assert_eq!(seen[data_pos].1, 100);
    assert_eq!(seen[order_pos].1, 100 + DELAY);
}

#[test]
fn round_trip_restores_balance_exactly() {
    let ids = OrderIds::new();
    let (strategy, updates) = Scripted::new(vec![
        Order::limit(&ids, symbol(), 2.0, 100.2),
        Order::limit(&ids, symbol(), -2.0, 100.0),
    ]);

    // both orders cross at fixed quotes with zero fees
    let mut bt = BacktestEngine::builder()
        .add_data(Box::new(VecDataset::new(vec![
            ticker(100, 100.2, 10.0, 100.2, 10.0),
            ticker(200, 100.2, 10.0, 100.2, 10.0),
        ])))
        .latency_model(Box::new(ConstantLatency::new(DELAY)))
        .fees(0.0, 0.0)
        .strategy(strategy)
        .build()
        .unwrap();
    bt.run().unwrap();

    assert_eq!(fills_of(&updates).len(), 2);
    let account = bt.server_account();
    assert_eq!(account.balance(), 0.0);
    assert!(account.positions().is_empty());
    assert_eq!(account.total_trade_count(), 2);
}

#[test]
fn bookkeeping_identity_reconstructed_from_fills() {
    let ids = OrderIds::new();
    let (strategy, updates) = Scripted::new(vec![
        Order::market(&ids, symbol(), 1.5),
        Order::limit(&ids, symbol(), -0.5, 100.0),
    ]);

    let mut bt = BacktestEngine::builder()
        .add_data(Box::new(VecDataset::new(vec![
            ticker(100, 100.0, 10.0, 100.2, 10.0),
            ticker(200, 100.0, 10.0, 100.2, 10.0),
            trade(300, 100.0, 20.0, Side::Sell),
            trade(400, 101.0, 1.0, Side::Buy),
        ])))
        .latency_model(Box::new(ConstantLatency::new(DELAY)))
        .fees(MAKER, TAKER)
        .strategy(strategy)
        .build()
        .unwrap();
    bt.run().unwrap();

    // replay the books from the observed fills
    let fills = fills_of(&updates);
    assert_eq!(fills.len(), 2);
    let mut balance = 0.0;
    let mut position = 0.0;
    for fill in &fills {
        balance -= fill.quantity * fill.filled_price + fill.commission_fee;
        position += fill.quantity;
    }

    let account = bt.server_account();
    assert!((account.balance() - balance).abs() < 1e-9);
    assert!((account.position("BTC-USDT") - position).abs() < 1e-9);

    // equity identity at the final mark
    let last = account.last_price("BTC-USDT").unwrap();
    assert_eq!(last, 101.0);
    assert!((account.equity() - (balance + position * last)).abs() < 1e-9);
}

#[test]
fn funding_settles_against_open_position() {
    let ids = OrderIds::new();
    let (strategy, _updates) = Scripted::new(vec![Order::market(&ids, symbol(), 2.0)]);

    let mut bt = BacktestEngine::builder()
        .add_data(Box::new(VecDataset::new(vec![
            ticker(100, 49_999.0, 5.0, 50_000.0, 5.0),
            trade(200, 50_000.0, 1.0, Side::Buy),
            Event::at(
                300,
                Payload::Funding(Funding {
                    symbol: symbol(),
                    funding_rate: 1e-4,
                    mark_price: 50_000.0,
                }),
            ),
        ])))
        .latency_model(Box::new(ConstantLatency::new(DELAY)))
        .fees(0.0, 0.0)
        .strategy(strategy)
        .build()
        .unwrap();
    bt.run().unwrap();

    let account = bt.server_account();
    // fee = 2.0 * 50_000 * 1e-4 = 10, on top of the 100k purchase
    assert!((account.balance() - (-100_000.0 - 10.0)).abs() < 1e-9);
    assert!((account.total_funding_fee() - 10.0).abs() < 1e-9);
    // funding leaves the equity identity intact
    assert!(
        (account.equity() - (account.balance() + 2.0 * account.last_price("BTC-USDT").unwrap()))
            .abs()
            < 1e-9
    );
}

#[test]
fn recorder_writes_run_artifacts() {
    let mut dir = std::env::temp_dir();
    dir.push(format!("tickbt_e2e_{}", std::process::id()));

    let ids = OrderIds::new();
    let (strategy, _updates) = Scripted::new(vec![Order::limit(&ids, symbol(), 1.0, 100.3)]);

    let mut bt = BacktestEngine::builder()
        .add_data(Box::new(VecDataset::new(vec![
            ticker(100, 100.0, 10.0, 100.2, 10.0),
            trade(500, 100.2, 1.0, Side::Buy),
            ticker(2_000, 100.0, 10.0, 100.2, 10.0),
        ])))
        .latency_model(Box::new(ConstantLatency::new(DELAY)))
        .fees(MAKER, TAKER)
        .timer_interval(1_000)
        .record_to(&dir)
        .strategy(strategy)
        .build()
        .unwrap();
    bt.run().unwrap();

    let trades = std::fs::read_to_string(dir.join("trades.csv")).unwrap();
    assert!(trades.starts_with("timestamp,order_id,symbol,price,quantity,commission"));
    assert_eq!(trades.lines().count(), 2, "one header and one fill");
    assert!(trades.contains("BTC-USDT"));

    let snapshots = std::fs::read_to_string(dir.join("snapshots.csv")).unwrap();
    assert!(snapshots.starts_with("timestamp,equity,balance"));
    assert!(snapshots.lines().count() >= 2, "at least one snapshot row");

    std::fs::remove_dir_all(&dir).ok();
}
