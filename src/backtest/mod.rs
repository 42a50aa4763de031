//! The global scheduler: two event engines bridged by delay buses, advanced
//! over a merged dataset on a single logical timeline.

use std::{fs::create_dir_all, path::PathBuf};

use anyhow::Context;
use tracing::info;

use crate::{
    account::Account,
    data::{DataSource, MergedDataset},
    delaybus::DelayBus,
    engine::EventEngine,
    matcher::MatchEngine,
    models::LatencyModel,
    order::OrderIds,
    recorder::Recorder,
    strategy::{Strategy, StrategyComponent},
    types::{BacktestError, BuildError, Event, Payload, Timestamp, INVALID_MAX},
};

/// A unit mounted on one of the two engines for the duration of a run.
///
/// `start` receives the run context and registers listeners; `stop` releases
/// resources. Both are called on the success and the failure path.
pub trait Component {
    fn start(&mut self, ctx: &RunContext) -> Result<(), BacktestError>;

    fn stop(&mut self) -> Result<(), BacktestError> {
        Ok(())
    }
}

/// Everything a component may need at `start`: the engine it is mounted on,
/// the account handle of its side, and the run's order id generator.
#[derive(Clone)]
pub struct RunContext {
    pub engine: EventEngine,
    pub account: Account,
    pub order_ids: OrderIds,
}

/// The backtest scheduler.
///
/// Each loop iteration picks the earliest of four candidates: the next
/// dataset event, the two delay-bus heads, and the next timer tick, then
/// dispatches exactly one of them. At equal timestamps the buses win over the
/// timer and the timer wins over data, so the strategy never sees fresh
/// market data ahead of an earlier-instant acknowledgment or tick. Dataset
/// events enter the server engine; timer ticks enter the client engine and
/// reach the server through the client-to-server bus.
pub struct BacktestEngine {
    server: EventEngine,
    client: EventEngine,
    s2c: DelayBus,
    c2s: DelayBus,
    dataset: MergedDataset,
    timer_interval: Option<Timestamp>,
    server_components: Vec<Box<dyn Component>>,
    client_components: Vec<Box<dyn Component>>,
    server_account: Account,
    client_account: Account,
    order_ids: OrderIds,
}

impl BacktestEngine {
    /// Returns a builder for the standard wiring.
    pub fn builder() -> BacktestEngineBuilder {
        BacktestEngineBuilder::new()
    }

    /// Returns the exchange-side engine.
    pub fn server_engine(&self) -> &EventEngine {
        &self.server
    }

    /// Returns the strategy-side engine.
    pub fn client_engine(&self) -> &EventEngine {
        &self.client
    }

    /// Returns the authoritative exchange-side account.
    pub fn server_account(&self) -> &Account {
        &self.server_account
    }

    /// Returns the strategy-side shadow account.
    pub fn client_account(&self) -> &Account {
        &self.client_account
    }

    /// Runs the backtest to completion: starts every component, replays the
    /// dataset, drains the delay buses, and stops every component. Stops run
    /// on the failure path too; the first error wins.
    pub fn run(&mut self) -> Result<(), BacktestError> {
        info!("backtest starting");
        let server_ctx = RunContext {
            engine: self.server.clone(),
            account: self.server_account.clone(),
            order_ids: self.order_ids.clone(),
        };
        let client_ctx = RunContext {
            engine: self.client.clone(),
            account: self.client_account.clone(),
            order_ids: self.order_ids.clone(),
        };

        let mut result = Ok(());
        for component in self.server_components.iter_mut() {
            if result.is_ok() {
                result = component.start(&server_ctx);
            }
        }
        for component in self.client_components.iter_mut() {
            if result.is_ok() {
                result = component.start(&client_ctx);
            }
        }

        if result.is_ok() {
            result = self.run_loop();
        }

        for component in self
            .server_components
            .iter_mut()
            .chain(self.client_components.iter_mut())
        {
            let stopped = component.stop();
            if result.is_ok() {
                result = stopped;
            }
        }
        info!(ok = result.is_ok(), "backtest finished");
        result
    }

    fn run_loop(&mut self) -> Result<(), BacktestError> {
        let mut current = self.dataset.next();
        let mut next_timer = match (&self.timer_interval, &current) {
            // the first tick aligns with the first data timestamp
            (Some(_), Some(event)) => event.timestamp,
            _ => INVALID_MAX,
        };

        while let Some(data) = &current {
            let t_data = data.timestamp;
            let t_s2c = self.s2c.next_timestamp();
            let t_c2s = self.c2s.next_timestamp();
            let min_t = t_data.min(t_s2c).min(t_c2s).min(next_timer);
            self.check_regression(min_t)?;

            if t_s2c <= min_t {
                self.s2c.process_until(t_s2c);
            } else if t_c2s <= min_t {
                self.c2s.process_until(t_c2s);
            } else if next_timer <= min_t {
                self.client.put(Event::at(next_timer, Payload::Timer));
                next_timer += self.timer_interval.expect("timer candidate without interval");
            } else {
                let event = current.take().expect("loop condition");
                self.server.put(event);
                current = self.dataset.next();
            }
        }

        // the dataset is exhausted: no further timer ticks, but responses and
        // forwarded events still in transit must land
        loop {
            let t_s2c = self.s2c.next_timestamp();
            let t_c2s = self.c2s.next_timestamp();
            if t_s2c == INVALID_MAX && t_c2s == INVALID_MAX {
                break;
            }
            self.check_regression(t_s2c.min(t_c2s))?;
            if t_s2c <= t_c2s {
                self.s2c.process_until(t_s2c);
            } else {
                self.c2s.process_until(t_c2s);
            }
        }
        Ok(())
    }

    /// Fails fast when the earliest candidate would move either clock
    /// backwards. Candidates are future work, so one behind a clock means the
    /// input is out of order or a component forged a timestamp.
    fn check_regression(&self, candidate: Timestamp) -> Result<(), BacktestError> {
        let clock = self.server.timestamp().max(self.client.timestamp());
        if candidate < self.server.timestamp() || candidate < self.client.timestamp() {
            return Err(BacktestError::TimeRegression { candidate, clock });
        }
        Ok(())
    }
}

/// Assembles the standard backtest wiring: a matcher, an authoritative
/// account, and an optional recorder on the server engine; a shadow account
/// and an optional strategy on the client engine; one latency model cloned
/// into both bus directions.
pub struct BacktestEngineBuilder {
    data: Vec<DataSource>,
    latency: Option<Box<dyn LatencyModel>>,
    fees: Option<(f64, f64)>,
    initial_balance: f64,
    timer_interval: Option<Timestamp>,
    recorder_dir: Option<PathBuf>,
    server_components: Vec<Box<dyn Component>>,
    client_components: Vec<Box<dyn Component>>,
}

impl BacktestEngineBuilder {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            latency: None,
            fees: None,
            initial_balance: 0.0,
            timer_interval: None,
            recorder_dir: None,
            server_components: Vec::new(),
            client_components: Vec::new(),
        }
    }

    /// Adds an ordered event source to the merged feed.
    pub fn add_data(mut self, source: DataSource) -> Self {
        self.data.push(source);
        self
    }

    /// Sets the latency model; it is cloned into each bus direction.
    pub fn latency_model(mut self, latency: Box<dyn LatencyModel>) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Sets the maker and taker fee rates, charged on traded value.
    pub fn fees(mut self, maker_fee: f64, taker_fee: f64) -> Self {
        self.fees = Some((maker_fee, taker_fee));
        self
    }

    /// Sets the initial cash balance of both accounts.
    pub fn initial_balance(mut self, balance: f64) -> Self {
        self.initial_balance = balance;
        self
    }

    /// Enables the periodic timer with the given interval.
    pub fn timer_interval(mut self, interval: Timestamp) -> Self {
        self.timer_interval = Some(interval);
        self
    }

    /// Enables the CSV recorder, writing under the given directory.
    pub fn record_to<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.recorder_dir = Some(dir.into());
        self
    }

    /// Mounts a strategy on the client engine.
    pub fn strategy<S: Strategy + 'static>(mut self, strategy: S) -> Self {
        self.client_components
            .push(Box::new(StrategyComponent::new(strategy)));
        self
    }

    /// Mounts an extra component on the server engine.
    pub fn server_component(mut self, component: Box<dyn Component>) -> Self {
        self.server_components.push(component);
        self
    }

    /// Mounts an extra component on the client engine.
    pub fn client_component(mut self, component: Box<dyn Component>) -> Self {
        self.client_components.push(component);
        self
    }

    /// Builds a `BacktestEngine`.
    pub fn build(self) -> Result<BacktestEngine, BuildError> {
        if let Some(interval) = self.timer_interval {
            if interval <= 0 {
                return Err(BuildError::InvalidArgument("timer interval must be positive"));
            }
        }
        let latency = self
            .latency
            .ok_or(BuildError::BuilderIncomplete("latency_model"))?;
        let (maker_fee, taker_fee) = self.fees.ok_or(BuildError::BuilderIncomplete("fees"))?;
        if let Some(dir) = &self.recorder_dir {
            create_dir_all(dir)
                .with_context(|| format!("cannot create recorder directory `{}`", dir.display()))?;
        }

        let server = EventEngine::new();
        let client = EventEngine::new();

        let s2c = DelayBus::new(dyn_clone::clone_box(&*latency), client.clone());
        s2c.attach(&server);
        let c2s = DelayBus::new(latency, server.clone());
        c2s.attach(&client);

        let server_account = Account::new(self.initial_balance);
        let client_account = Account::new(self.initial_balance);

        let mut server_components: Vec<Box<dyn Component>> =
            vec![Box::new(MatchEngine::new(maker_fee, taker_fee))];
        server_components.push(Box::new(server_account.clone()));
        if let Some(dir) = self.recorder_dir {
            server_components.push(Box::new(Recorder::new(dir)));
        }
        server_components.extend(self.server_components);

        let mut client_components: Vec<Box<dyn Component>> =
            vec![Box::new(client_account.clone())];
        client_components.extend(self.client_components);

        Ok(BacktestEngine {
            server,
            client,
            s2c,
            c2s,
            dataset: MergedDataset::new(self.data),
            timer_interval: self.timer_interval,
            server_components,
            client_components,
            server_account,
            client_account,
            order_ids: OrderIds::new(),
        })
    }
}

impl Default for BacktestEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::{
        data::VecDataset,
        models::ConstantLatency,
        types::{EventKind, Side, Symbol, Trade},
    };

    fn trade(ts: Timestamp, price: f64) -> Event {
        let symbol: Symbol = Rc::from("BTC-USDT");
        Event::at(
            ts,
            Payload::Trade(Trade {
                symbol,
                price,
                qty: 1.0,
                side: Side::Buy,
            }),
        )
    }

    /// Records every event seen on its engine, tagged for assertions.
    struct Spy {
        seen: Rc<RefCell<Vec<(EventKind, Timestamp)>>>,
        started: Rc<RefCell<bool>>,
        stopped: Rc<RefCell<bool>>,
    }

    impl Spy {
        fn new() -> (Self, Rc<RefCell<Vec<(EventKind, Timestamp)>>>) {
            let seen = Rc::new(RefCell::new(Vec::new()));
            (
                Self {
                    seen: seen.clone(),
                    started: Rc::new(RefCell::new(false)),
                    stopped: Rc::new(RefCell::new(false)),
                },
                seen,
            )
        }
    }

    impl Component for Spy {
        fn start(&mut self, ctx: &RunContext) -> Result<(), BacktestError> {
            *self.started.borrow_mut() = true;
            let seen = self.seen.clone();
            ctx.engine.register_global(false, true, move |ev| {
                seen.borrow_mut().push((ev.kind(), ev.timestamp));
            });
            Ok(())
        }

        fn stop(&mut self) -> Result<(), BacktestError> {
            *self.stopped.borrow_mut() = true;
            Ok(())
        }
    }

    fn engine_with(
        data: Vec<Event>,
        delay: Timestamp,
        timer: Option<Timestamp>,
    ) -> (BacktestEngine, Rc<RefCell<Vec<(EventKind, Timestamp)>>>, Rc<RefCell<Vec<(EventKind, Timestamp)>>>) {
        let (server_spy, server_seen) = Spy::new();
        let (client_spy, client_seen) = Spy::new();
        let mut builder = BacktestEngine::builder()
            .add_data(Box::new(VecDataset::new(data)))
            .latency_model(Box::new(ConstantLatency::new(delay)))
            .fees(0.0, 0.0)
            .server_component(Box::new(server_spy))
            .client_component(Box::new(client_spy));
        if let Some(interval) = timer {
            builder = builder.timer_interval(interval);
        }
        (builder.build().unwrap(), server_seen, client_seen)
    }

    #[test]
    fn data_reaches_server_then_client_with_delay() {
        let (mut bt, server_seen, client_seen) =
            engine_with(vec![trade(100, 1.0), trade(200, 2.0)], 10, None);
        bt.run().unwrap();

        let server: Vec<_> = server_seen.borrow().clone();
        assert_eq!(
            server,
            vec![(EventKind::Trade, 100), (EventKind::Trade, 200)]
        );
        // the client observes the same events, delayed; their own timestamps
        // are preserved while the client clock advances to the ready times
        let client: Vec<_> = client_seen.borrow().clone();
        assert_eq!(
            client,
            vec![(EventKind::Trade, 100), (EventKind::Trade, 200)]
        );
        assert_eq!(bt.client_engine().timestamp(), 210);
    }

    #[test]
    fn timer_ticks_between_data_events() {
        let (mut bt, _server_seen, client_seen) =
            engine_with(vec![trade(100, 1.0), trade(200, 2.0)], 5, Some(50));
        bt.run().unwrap();

        let timers: Vec<_> = client_seen
            .borrow()
            .iter()
            .filter(|(kind, _)| *kind == EventKind::Timer)
            .map(|(_, ts)| *ts)
            .collect();
        // aligned to the first data timestamp, no ticks after data ends
        assert_eq!(timers, vec![100, 150, 200]);
    }

    #[test]
    fn timer_precedes_data_at_equal_timestamp() {
        let (mut bt, _server, client_seen) = engine_with(vec![trade(100, 1.0)], 0, Some(100));
        bt.run().unwrap();

        let client: Vec<_> = client_seen.borrow().clone();
        // with zero delay the data still arrives after the tick of the same
        // instant
        assert_eq!(
            client,
            vec![(EventKind::Timer, 100), (EventKind::Trade, 100)]
        );
    }

    #[test]
    fn out_of_order_data_fails_fast() {
        let events = vec![trade(200, 1.0), trade(100, 2.0)];
        // VecDataset would assert in debug builds; bypass it with a raw source
        let mut bt = BacktestEngine::builder()
            .add_data(Box::new(events.into_iter()))
            .latency_model(Box::new(ConstantLatency::new(10)))
            .fees(0.0, 0.0)
            .build()
            .unwrap();
        let result = bt.run();
        assert!(matches!(
            result,
            Err(BacktestError::TimeRegression { candidate: 100, .. })
        ));
    }

    #[test]
    fn components_start_and_stop() {
        let (spy, _) = Spy::new();
        let started = spy.started.clone();
        let stopped = spy.stopped.clone();
        let mut bt = BacktestEngine::builder()
            .add_data(Box::new(VecDataset::new(vec![trade(1, 1.0)])))
            .latency_model(Box::new(ConstantLatency::new(1)))
            .fees(0.0, 0.0)
            .server_component(Box::new(spy))
            .build()
            .unwrap();
        bt.run().unwrap();
        assert!(*started.borrow());
        assert!(*stopped.borrow());
    }

    #[test]
    fn builder_requires_latency_and_fees() {
        let result = BacktestEngine::builder().fees(0.0, 0.0).build();
        assert!(matches!(result, Err(BuildError::BuilderIncomplete("latency_model"))));
        let result = BacktestEngine::builder()
            .latency_model(Box::new(ConstantLatency::new(1)))
            .build();
        assert!(matches!(result, Err(BuildError::BuilderIncomplete("fees"))));
    }

    #[test]
    fn empty_dataset_terminates() {
        let mut bt = BacktestEngine::builder()
            .add_data(Box::new(VecDataset::new(vec![])))
            .latency_model(Box::new(ConstantLatency::new(1)))
            .fees(0.0, 0.0)
            .timer_interval(100)
            .build()
            .unwrap();
        bt.run().unwrap();
    }
}
