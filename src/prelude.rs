//! Convenience re-exports for platform consumers and adapter authors.

pub use crate::algo::{Algo, AlgoCtx, AlgoManager, AlgoParams, Instrument};
pub use crate::catalog::{
    BrokerAccount, Catalog, Exchange, Security, SecurityType, SubAccount, User,
};
pub use crate::config::{AdapterConfig, AdapterKind, Config};
pub use crate::consolidation::{BookSide, ConsolidationBook, PickedQuote};
pub use crate::core::{AdapterRegistry, Core, CoreOptions};
pub use crate::dispatch::{ExchangeAdapter, ExchangeDispatch};
pub use crate::marketdata::{DataSrc, MarketDataFeed, MarketDataStore, MdSnapshot, Quote, Trade};
pub use crate::orderbook::{
    Confirmation, Contract, ExecTransType, OrdType, Order, OrderBook, OrderStatus, Side, Tif,
};
pub use crate::position::{Pnl, Position, PositionManager, Scope, Targets};
pub use crate::risk::{Limits, RiskGate};
pub use crate::server::Session;
