//! # tradedesk — an electronic trading platform core
//!
//! A desk-grade trading core: it accepts client order intents, enforces
//! pre-trade risk, routes live orders to broker adapters, consumes
//! multi-source market data, runs algorithmic strategies against that data
//! and maintains authoritative positions, PnL and execution history.
//!
//! ## Subsystems
//!
//! - **Order lifecycle & global book** ([`orderbook`]) — id allocation, the
//!   order state machine, duplicate-execution suppression, a durable
//!   append-only journal and offline replay.
//! - **Exchange dispatch & risk gate** ([`dispatch`], [`risk`]) — the
//!   synchronous path taking a submitted order through limits, throttles and
//!   position checks, assigning a broker and handing it to an adapter.
//! - **Market-data fan-out** ([`marketdata`]) — per-source quote/trade
//!   stores with lock-free reads, per-security subscription and update
//!   notification into the algo runtime.
//! - **Algorithm runtime** ([`algo`]) — sharded worker threads with
//!   per-algo affinity, timers, instrument accounting and confirmation
//!   dispatch; ships a built-in TWAP.
//! - **Consolidation book** ([`consolidation`]) — a multi-source
//!   price-level book for smart-routing strategies.
//! - **Internal cross engine** ([`cross`]) — matches internal buy/sell
//!   crossing orders at a mid/last/close reference price.
//! - **Position & PnL accounting** ([`position`]) — trade-driven position
//!   mutation at three aggregation scopes, unrealized/realized PnL and
//!   durable persistence.
//! - **Reference catalog** ([`catalog`]) — exchanges, securities, users and
//!   accounts, loaded once from the relational store and published through
//!   atomic replacement.
//!
//! The [`core::Core`] composition root wires everything together; there are
//! no global singletons, so tests assemble their own core over a temporary
//! store.
//!
//! ## Concurrency model
//!
//! Mixed parallel-thread + cooperative-within-shard: N single-threaded algo
//! shards, one journal writer per stream, a dedicated position-row writer, a
//! shared tokio pool for timers and retries, and adapter-owned I/O threads
//! entering the core through short critical sections. Confirmations for a
//! single order are totally ordered; market-data readers accept slightly
//! stale snapshots in exchange for a lock-free read path.

pub mod algo;
pub mod catalog;
pub mod config;
pub mod consolidation;
pub mod core;
pub mod cross;
pub mod dispatch;
pub mod marketdata;
pub mod orderbook;
pub mod position;
pub mod prelude;
pub mod risk;
pub mod server;
pub mod sim;
mod utils;

pub use crate::core::{AdapterRegistry, Core, CoreError, CoreOptions};
pub use algo::{Algo, AlgoCtx, AlgoManager, AlgoParams, Instrument};
pub use catalog::Catalog;
pub use config::Config;
pub use consolidation::{BookSide, ConsolidationBook, ConsolidationManager};
pub use cross::CrossEngine;
pub use dispatch::{ExchangeAdapter, ExchangeDispatch};
pub use marketdata::{DataSrc, MarketDataFeed, MarketDataStore, MdSnapshot};
pub use orderbook::{
    Confirmation, Contract, ExecTransType, OrdType, Order, OrderBook, OrderStatus, Side, Tif,
};
pub use position::{Pnl, Position, PositionManager, PositionValue, Scope};
pub use risk::{Limits, RiskGate, StopBook, Throttle};
pub use server::Session;
