use std::{
    cell::RefCell,
    fs::{create_dir_all, File},
    io::{BufWriter, Write},
    path::PathBuf,
    rc::Rc,
};

use tracing::warn;

use crate::{
    account::Account,
    backtest::{Component, RunContext},
    order::OrderState,
    types::{BacktestError, EventKind, Payload, Timestamp},
};

/// Running totals as of the previous snapshot; the snapshot file carries
/// deltas for everything except equity and balance.
#[derive(Default, Clone, Copy)]
struct Baseline {
    commission: f64,
    funding: f64,
    trade_pnl: f64,
    trade_count: u64,
    turnover: f64,
}

struct RecorderInner {
    dir: PathBuf,
    trades: Option<BufWriter<File>>,
    snapshots: Option<BufWriter<File>>,
    account: Option<Account>,
    baseline: Baseline,
}

impl RecorderInner {
    fn on_fill(&mut self, ts: Timestamp, order: &crate::order::Order) {
        let Some(file) = self.trades.as_mut() else {
            return;
        };
        let line = format!(
            "{},{},{},{},{},{}\n",
            ts, order.order_id, order.symbol, order.filled_price, order.quantity,
            order.commission_fee
        );
        if let Err(err) = file.write_all(line.as_bytes()) {
            // best effort while running; the close at stop is the hard gate
            warn!(error = %err, "trade record write failed");
        }
    }

    fn on_timer(&mut self, ts: Timestamp) {
        let Some(account) = self.account.clone() else {
            return;
        };
        let Some(file) = self.snapshots.as_mut() else {
            return;
        };
        let commission = account.total_commission();
        let funding = account.total_funding_fee();
        let trade_pnl = account.total_trade_pnl();
        let trade_count = account.total_trade_count();
        let turnover = account.total_turnover();

        let line = format!(
            "{},{},{},{},{},{},{},{}\n",
            ts,
            account.equity(),
            account.balance(),
            commission - self.baseline.commission,
            funding - self.baseline.funding,
            trade_pnl - self.baseline.trade_pnl,
            trade_count - self.baseline.trade_count,
            turnover - self.baseline.turnover,
        );
        if let Err(err) = file.write_all(line.as_bytes()) {
            warn!(error = %err, "snapshot record write failed");
        }

        self.baseline = Baseline {
            commission,
            funding,
            trade_pnl,
            trade_count,
            turnover,
        };
    }
}

/// Writes the run's trades and periodic account snapshots as CSV.
///
/// Two files are created under the configured directory at start:
///
/// * `trades.csv` with `timestamp,order_id,symbol,price,quantity,commission`,
///   one row per fill;
/// * `snapshots.csv` with
///   `timestamp,equity,balance,commission,funding,pnl,trade_count,trade_amount`,
///   one row per timer tick, where every column except equity and balance is
///   the change since the previous row.
///
/// Mounted on the server engine; the timer ticks that pace the snapshots
/// arrive through the client-to-server bus. Write failures during the run are
/// logged and skipped; a failure to flush at stop fails the run.
pub struct Recorder {
    inner: Rc<RefCell<RecorderInner>>,
}

impl Recorder {
    /// Constructs a `Recorder` writing under `dir`. The directory is created
    /// at start if missing.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RecorderInner {
                dir: dir.into(),
                trades: None,
                snapshots: None,
                account: None,
                baseline: Baseline::default(),
            })),
        }
    }
}

impl Component for Recorder {
    fn start(&mut self, ctx: &RunContext) -> Result<(), BacktestError> {
        {
            let mut inner = self.inner.borrow_mut();
            create_dir_all(&inner.dir)?;

            let mut trades = BufWriter::new(File::create(inner.dir.join("trades.csv"))?);
            trades.write_all(b"timestamp,order_id,symbol,price,quantity,commission\n")?;
            let mut snapshots = BufWriter::new(File::create(inner.dir.join("snapshots.csv"))?);
            snapshots.write_all(
                b"timestamp,equity,balance,commission,funding,pnl,trade_count,trade_amount\n",
            )?;

            inner.trades = Some(trades);
            inner.snapshots = Some(snapshots);
            inner.account = Some(ctx.account.clone());
        }

        let inner = self.inner.clone();
        ctx.engine.register(EventKind::Order, true, move |ev| {
            if let Payload::Order(order) = &ev.payload {
                if order.state == OrderState::Filled {
                    inner.borrow_mut().on_fill(ev.timestamp, order);
                }
            }
        });

        let inner = self.inner.clone();
        ctx.engine.register(EventKind::Timer, true, move |ev| {
            inner.borrow_mut().on_timer(ev.timestamp);
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BacktestError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(mut file) = inner.trades.take() {
            file.flush()?;
        }
        if let Some(mut file) = inner.snapshots.take() {
            file.flush()?;
        }
        Ok(())
    }
}
