pub use crate::{
    account::{Account, SymbolStats},
    backtest::{BacktestEngine, BacktestEngineBuilder, Component, RunContext},
    data::{CsvDataset, DataSource, MergedDataset, VecDataset},
    delaybus::DelayBus,
    engine::EventEngine,
    matcher::MatchEngine,
    models::{ConstantLatency, LatencyModel, OrderPriorityLatency},
    order::{OrdType, Order, OrderId, OrderIds, OrderState},
    recorder::Recorder,
    strategy::{Strategy, StrategyComponent, StrategyCtx},
    types::{
        from_scaled, to_scaled, BacktestError, BookTicker, BuildError, Delivery, Event, EventKind,
        Funding, Identity, Payload, Side, Symbol, Timestamp, Trade, INVALID_MAX, INVALID_MIN,
        SCALER,
    },
};
