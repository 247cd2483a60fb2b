//! In-process simulator adapters: an exchange that fills marketable orders
//! against the current book and acknowledges the rest, and a market-data
//! feed driven directly through the store. Used by tests and demo wiring.

use crate::core::{AdapterRegistry, Core};
use crate::dispatch::{ExchangeAdapter, ExchangeDispatch};
use crate::marketdata::{DataSrc, MarketDataFeed, MarketDataStore};
use crate::orderbook::{ExecTransType, OrdType, Order};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Simulated exchange connectivity. Orders crossing the current top of
/// book fill immediately and completely; everything else rests as `new`
/// until cancelled.
pub struct SimExchange {
    name: String,
    dispatch: Arc<ExchangeDispatch>,
    md: Arc<MarketDataStore>,
    connected: AtomicBool,
}

impl SimExchange {
    pub fn new(name: &str, dispatch: Arc<ExchangeDispatch>, md: Arc<MarketDataStore>) -> Self {
        Self {
            name: name.to_string(),
            dispatch,
            md,
            connected: AtomicBool::new(true),
        }
    }

    pub fn set_connected(&self, v: bool) {
        self.connected.store(v, Ordering::Release);
    }

    fn fill_price(&self, ord: &Order) -> Option<f64> {
        let src = self.md.default_feed().map(|f| f.src()).unwrap_or(DataSrc(0));
        let snap = self.md.snapshot(src, ord.security_id());
        let q = snap.quote();
        match ord.ord_type() {
            OrdType::Market => {
                let px = if ord.is_buy() { q.ask_price } else { q.bid_price };
                if px > 0.0 {
                    Some(px)
                } else if snap.trade.close > 0.0 {
                    Some(snap.trade.close)
                } else if ord.price() > 0.0 {
                    // Dispatch pre-filled the price from the last trade.
                    Some(ord.price())
                } else {
                    None
                }
            }
            OrdType::Limit => {
                if ord.is_buy() && q.ask_price > 0.0 && ord.price() >= q.ask_price {
                    Some(q.ask_price)
                } else if !ord.is_buy() && q.bid_price > 0.0 && ord.price() <= q.bid_price {
                    Some(q.bid_price)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl ExchangeAdapter for SimExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn reconnect(&self) {
        self.connected.store(true, Ordering::Release);
    }

    fn place(&self, ord: &Order) -> String {
        self.dispatch
            .handle_new(ord.id, &format!("SIM-{}", ord.id), 0);
        if let Some(px) = self.fill_price(ord) {
            self.dispatch.handle_fill(
                ord.id,
                ord.qty(),
                px,
                &format!("SIM-{}", Uuid::new_v4()),
                0,
                false,
                ExecTransType::New,
                None,
            );
        }
        String::new()
    }

    fn cancel(&self, ord: &Order) -> String {
        self.dispatch.handle_canceled(ord.id, ord.orig_id, "", 0);
        String::new()
    }
}

/// Simulated market-data feed. Ticks are pushed straight into the store by
/// the test or backtest driver; subscription is a no-op.
pub struct SimFeed {
    name: String,
    src: DataSrc,
    connected: AtomicBool,
}

impl SimFeed {
    pub fn new(name: &str, src: &str) -> Self {
        Self {
            name: name.to_string(),
            src: DataSrc::from_name(src),
            connected: AtomicBool::new(true),
        }
    }
}

impl MarketDataFeed for SimFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn src(&self) -> DataSrc {
        self.src
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn subscribe_sync(&self, _sec: &crate::catalog::Security) {}
}

/// Register the simulator drivers under the `sim` name.
pub fn register(registry: &mut AdapterRegistry) {
    registry.register_md(
        "sim",
        Arc::new(|_core: &Arc<Core>, cfg| {
            let src = cfg.params.get("src").map(String::as_str).unwrap_or("SIM");
            Ok(Arc::new(SimFeed::new(&cfg.name, src)) as Arc<dyn MarketDataFeed>)
        }),
    );
    registry.register_ec(
        "sim",
        Arc::new(|core: &Arc<Core>, cfg| {
            Ok(Arc::new(SimExchange::new(
                &cfg.name,
                core.dispatch.clone(),
                core.md.clone(),
            )) as Arc<dyn ExchangeAdapter>)
        }),
    );
}
