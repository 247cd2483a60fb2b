//! The composition root: wires every subsystem together in place of global
//! singletons, owns the shared timer pool and drives startup/shutdown.

use crate::algo::{twap::Twap, AlgoManager};
use crate::catalog::Catalog;
use crate::config::{AdapterConfig, AdapterKind, Config};
use crate::consolidation::ConsolidationManager;
use crate::cross::CrossEngine;
use crate::dispatch::{ExchangeAdapter, ExchangeDispatch};
use crate::marketdata::{MarketDataFeed, MarketDataStore};
use crate::orderbook::{Confirmation, ConfirmationSink, Order, OrderBook};
use crate::position::{CommissionAdapter, CommissionManager, PositionManager, SessionInfo};
use crate::risk::RiskGate;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Journal(#[from] crate::orderbook::JournalError),
    #[error(transparent)]
    Store(#[from] crate::position::StoreError),
    #[error(transparent)]
    MarketData(#[from] crate::marketdata::MarketDataError),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("adapter error: {0}")]
    Adapter(String),
}

/// Runtime options of the composition root.
#[derive(Debug, Clone)]
pub struct CoreOptions {
    pub store_dir: PathBuf,
    pub db_path: PathBuf,
    pub algo_threads: usize,
    pub io_threads: usize,
    pub disable_rms: bool,
    /// Delay before the first PnL recomputation (last prices need a moment
    /// to arrive after startup).
    pub pnl_start_delay: Duration,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./store"),
            db_path: PathBuf::from("./store/tradedesk.db"),
            algo_threads: 1,
            io_threads: 1,
            disable_rms: false,
            pnl_start_delay: Duration::from_secs(15),
        }
    }
}

/// Builds a market-data feed from an adapter config section.
pub type MdAdapterFactory =
    Arc<dyn Fn(&Arc<Core>, &AdapterConfig) -> Result<Arc<dyn MarketDataFeed>, String> + Send + Sync>;
/// Builds an exchange-connectivity adapter from an adapter config section.
pub type EcAdapterFactory =
    Arc<dyn Fn(&Arc<Core>, &AdapterConfig) -> Result<Arc<dyn ExchangeAdapter>, String> + Send + Sync>;

/// Compile-time adapter registry; the config `driver` key selects a
/// factory. Replaces shared-object loading.
#[derive(Default)]
pub struct AdapterRegistry {
    md: HashMap<String, MdAdapterFactory>,
    ec: HashMap<String, EcAdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_md(&mut self, driver: &str, factory: MdAdapterFactory) {
        self.md.insert(driver.to_string(), factory);
    }

    pub fn register_ec(&mut self, driver: &str, factory: EcAdapterFactory) {
        self.ec.insert(driver.to_string(), factory);
    }
}

/// The assembled platform core.
pub struct Core {
    pub catalog: Arc<Catalog>,
    pub md: Arc<MarketDataStore>,
    pub consolidation: Arc<ConsolidationManager>,
    pub book: Arc<OrderBook>,
    pub commissions: Arc<CommissionManager>,
    pub positions: Arc<PositionManager>,
    pub risk: Arc<RiskGate>,
    pub dispatch: Arc<ExchangeDispatch>,
    pub cross: Arc<CrossEngine>,
    pub algos: Arc<AlgoManager>,
    pub session: SessionInfo,
    runtime: tokio::runtime::Runtime,
}

// The sinks hold weak references: the book is itself held by the managers
// it fans out to, and the composition root keeps everything alive.
struct PositionSink(Weak<PositionManager>);

impl ConfirmationSink for PositionSink {
    fn on_confirmation(&self, cm: &Confirmation, ord: &Order) {
        if let Some(positions) = self.0.upgrade() {
            positions.handle(cm, ord, false);
        }
    }
}

struct AlgoSink(Weak<AlgoManager>);

impl ConfirmationSink for AlgoSink {
    fn on_confirmation(&self, cm: &Confirmation, ord: &Order) {
        if let Some(algos) = self.0.upgrade() {
            algos.handle(cm, ord);
        }
    }
}

struct CrossSink(Weak<CrossEngine>);

impl ConfirmationSink for CrossSink {
    fn on_confirmation(&self, cm: &Confirmation, ord: &Order) {
        if !cm.is_fill() {
            return;
        }
        if let Some(cross) = self.0.upgrade() {
            cross.update_trade(cm, ord);
        }
    }
}

impl Core {
    /// Wire the whole platform. The catalog is loaded by the caller (from
    /// the relational store or built in code for tests).
    pub fn open(catalog: Arc<Catalog>, opts: CoreOptions) -> Result<Arc<Self>, CoreError> {
        std::fs::create_dir_all(&opts.store_dir)?;

        let commissions = Arc::new(CommissionManager::new());
        let (positions, session) = PositionManager::new(
            catalog.clone(),
            commissions.clone(),
            &opts.store_dir,
            &opts.db_path,
        )?;
        let positions = Arc::new(positions);

        let book = Arc::new(OrderBook::open(&opts.store_dir)?);
        if session.is_new {
            let n = book.load_previous_exec_ids()?;
            if n > 0 {
                info!("loaded {n} previous-session exec ids");
            }
        }

        let md = Arc::new(MarketDataStore::new(catalog.clone()));
        let consolidation = Arc::new(ConsolidationManager::new());
        md.set_consolidation(consolidation.clone());

        let risk = Arc::new(RiskGate::new(catalog.clone(), positions.clone()));
        if opts.disable_rms {
            info!("rms disabled");
            risk.disable();
        }

        let dispatch = Arc::new(ExchangeDispatch::new(
            catalog.clone(),
            book.clone(),
            risk.clone(),
            md.clone(),
        ));

        let cross = Arc::new(CrossEngine::new(catalog.clone()));
        cross.set_book(book.clone());
        cross.set_md(md.clone());
        cross.set_dispatch(dispatch.clone());

        let algos = Arc::new(AlgoManager::open(
            catalog.clone(),
            md.clone(),
            &opts.store_dir,
        )?);
        md.set_algos(&algos);
        cross.set_algos(&algos);
        algos.set_dispatch(dispatch.clone());
        algos.set_cross(cross.clone());
        algos.set_consolidation(consolidation.clone());
        algos.set_book(book.clone());
        algos.register_algo("TWAP", Arc::new(|| Box::new(Twap::default()) as Box<dyn crate::algo::Algo>));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(opts.io_threads.max(1))
            .enable_time()
            .thread_name("task-pool")
            .build()?;
        dispatch.set_runtime(runtime.handle().clone());
        algos.set_runtime(runtime.handle().clone());

        book.set_sinks(vec![
            Arc::new(PositionSink(Arc::downgrade(&positions))) as Arc<dyn ConfirmationSink>,
            Arc::new(AlgoSink(Arc::downgrade(&algos))),
            Arc::new(CrossSink(Arc::downgrade(&cross))),
        ]);

        algos.start(opts.algo_threads);

        // PnL cadence: once per second after the initial warm-up.
        {
            let positions = positions.clone();
            let md = md.clone();
            let catalog = catalog.clone();
            let delay = opts.pnl_start_delay;
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tick.tick().await;
                    positions.update_pnl(&|sec_id| {
                        catalog
                            .security(sec_id)
                            .map(|sec| md.current_price(&sec))
                            .unwrap_or(0.0)
                    });
                }
            });
        }

        Ok(Arc::new(Self {
            catalog,
            md,
            consolidation,
            book,
            commissions,
            positions,
            risk,
            dispatch,
            cross,
            algos,
            session,
            runtime,
        }))
    }

    pub fn runtime(&self) -> &tokio::runtime::Runtime {
        &self.runtime
    }

    /// Construct and register every adapter named in the config.
    pub fn load_adapters(
        self: &Arc<Self>,
        config: &Config,
        registry: &AdapterRegistry,
    ) -> Result<(), CoreError> {
        for adapter in &config.adapters {
            match adapter.kind {
                AdapterKind::MarketData => {
                    let factory = registry
                        .md
                        .get(&adapter.driver)
                        .ok_or_else(|| {
                            CoreError::Adapter(format!("unknown md driver: {}", adapter.driver))
                        })?;
                    let feed = factory(self, adapter).map_err(CoreError::Adapter)?;
                    let markets = adapter
                        .params
                        .get("markets")
                        .or_else(|| adapter.params.get("exchanges"))
                        .cloned()
                        .unwrap_or_default();
                    self.md.add_feed(feed, &markets)?;
                }
                AdapterKind::ExchangeConnectivity => {
                    let factory = registry
                        .ec
                        .get(&adapter.driver)
                        .ok_or_else(|| {
                            CoreError::Adapter(format!("unknown ec driver: {}", adapter.driver))
                        })?;
                    let ec = factory(self, adapter).map_err(CoreError::Adapter)?;
                    self.dispatch.add_adapter(ec);
                }
                AdapterKind::Commission => {
                    let mut cm = CommissionAdapter::new(adapter.name.clone());
                    if let Some(table) = adapter.params.get("table") {
                        cm.parse_table(table, &self.catalog)
                            .map_err(CoreError::Adapter)?;
                    }
                    self.commissions.add(cm);
                }
            }
        }
        for feed in self.md.feeds() {
            feed.start();
        }
        for adapter in self.dispatch.adapters() {
            adapter.start();
        }
        Ok(())
    }

    /// Graceful shutdown: stop all algos, let confirmations drain, then
    /// cancel every live order and flush the journals.
    pub fn shutdown(self: &Arc<Self>, grace: Duration) {
        info!("shutting down");
        self.algos.stop_all();
        self.algos.quiesce();
        std::thread::sleep(grace);
        self.dispatch.cancel_all();
        self.algos.quiesce();
        self.book.sync_journal();
        self.algos.sync_journal();
        self.positions.close();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::core_fixture;
    use super::*;
    use crate::orderbook::{Contract, OrderStatus, Side};
    use crate::risk::Limits;
    use serde_json::json;

    #[test]
    fn test_wiring_rejects_without_adapter() {
        let (core, _dir) = core_fixture(Limits::default());
        let ord = crate::orderbook::Order::from_contract(
            Contract {
                security_id: 1,
                sub_account_id: 1,
                qty: 100.0,
                price: 10.0,
                side: Side::Buy,
                ..Default::default()
            },
            3,
        );
        let err = core.dispatch.place(ord).unwrap_err();
        assert!(err.contains("is not started"));
        assert_eq!(
            core.book.orders_with_status(OrderStatus::RiskRejected).len(),
            1
        );
    }

    #[test]
    fn test_session_login_over_fixture() {
        let (core, _dir) = core_fixture(Limits::default());
        let mut session = crate::server::Session::new(core);
        let out = session.handle(&json!([
            "login",
            "trader",
            crate::server::password_digest("secret")
        ]));
        assert_eq!(out[0][1], "ok");
    }

    #[test]
    fn test_load_adapters_from_config() {
        let (core, _dir) = core_fixture(Limits::default());
        let mut registry = AdapterRegistry::new();
        crate::sim::register(&mut registry);
        let config = crate::config::Config::parse(
            "[md-sim]\ndriver = \"sim\"\nsrc = \"SIM\"\nmarkets = \"NYSE\"\n\n\
             [ec-sim]\ndriver = \"sim\"\n\n\
             [cm-fees]\ndriver = \"table\"\ntable = \"per_share=0.01\"\n",
        )
        .unwrap();
        core.load_adapters(&config, &registry).unwrap();
        assert!(core.md.default_feed().is_some());
        assert!(core.dispatch.adapter("ec-sim").is_some());
        assert!(core.commissions.get("cm-fees").is_some());

        // Unknown drivers are configuration errors.
        let bad = crate::config::Config::parse("[ec-x]\ndriver = \"fixnet\"\n").unwrap();
        assert!(core.load_adapters(&bad, &registry).is_err());
    }
}
