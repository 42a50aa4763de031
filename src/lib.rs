//! # tickbt
//!
//! A discrete-event backtesting framework for high-frequency trading
//! strategies, replayed against historical market-microstructure data:
//! top-of-book snapshots, aggregated trade prints, periodic funding, and
//! delivery events.
//!
//! The simulation runs two single-threaded event engines on one logical
//! timeline. The server engine plays the exchange: a matching engine
//! reconstructs each resting order's queue position from displayed sizes and
//! trade prints and fills only on evidence, while an account keeps exact
//! scaled-integer positions. The client engine plays the strategy process:
//! it observes market data and order updates only after the configured
//! latency, and its orders take the same latency back. A global scheduler
//! interleaves the dataset, both delay buses, and an optional periodic timer
//! deterministically.
//!
//! ## Key features
//! - Deterministic single-threaded replay with dual engine clocks.
//! - Conservative maker-queue position estimation from top-of-book and trade
//!   feeds.
//! - Pluggable order and feed latency models.
//! - Exact fixed-point position and cash accounting with funding and
//!   delivery handling.
//! - CSV trade and snapshot recording for performance analysis.

/// Account bookkeeping driven by fills, funding, and delivery.
pub mod account;

/// The global scheduler, components, and the backtest builder.
pub mod backtest;

/// Event datasets and the k-way merge.
pub mod data;

/// Latency buses between the two engines.
pub mod delaybus;

/// The event engine.
pub mod engine;

/// The order matching engine and its book.
pub mod matcher;

/// Pluggable simulation models.
pub mod models;

/// Order messages and the run-scoped id generator.
pub mod order;

/// CSV recording of trades and account snapshots.
pub mod recorder;

/// The strategy seam.
pub mod strategy;

/// Core event and error types.
pub mod types;

/// Provides common types.
pub mod prelude;
