//! The internal cross engine: matches same-firm buy/sell crossing orders
//! per security at a mid/last/close reference price, without touching any
//! venue.

use crate::algo::AlgoManager;
use crate::catalog::Catalog;
use crate::dispatch::ExchangeDispatch;
use crate::marketdata::{DataSrc, MarketDataStore};
use crate::orderbook::{Confirmation, OrdType, Order, OrderBook};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::debug;

/// A resting crossing order. Carries what the global order cannot: market
/// fills consumed away from the cross (`filled_in_market`) and the per-order
/// exec-id counter.
#[derive(Debug, Clone)]
struct CrossOrder {
    order_id: u32,
    algo_id: u32,
    instrument_id: u64,
    filled_in_market: f64,
    count: u32,
}

#[derive(Default)]
struct Queues {
    buys: VecDeque<CrossOrder>,
    sells: VecDeque<CrossOrder>,
}

#[derive(Default)]
struct CrossSecurity {
    inner: Mutex<Queues>,
}

/// Deferred side effects of a match pass; executed after the per-security
/// mutex is released so fills re-entering the book never hold it.
enum Action {
    CancelInstrument(u64),
    Fill {
        order_id: u32,
        qty: f64,
        price: f64,
        exec_id: String,
    },
}

/// The cross engine. One mutex per security's queues; the engine-level map
/// only guards the handle table.
pub struct CrossEngine {
    catalog: Arc<Catalog>,
    securities: DashMap<u32, Arc<CrossSecurity>>,
    book: OnceLock<Arc<OrderBook>>,
    md: OnceLock<Arc<MarketDataStore>>,
    // Weak: the algo manager holds this engine by Arc.
    algos: OnceLock<Weak<AlgoManager>>,
    dispatch: OnceLock<Arc<ExchangeDispatch>>,
}

impl CrossEngine {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            securities: DashMap::new(),
            book: OnceLock::new(),
            md: OnceLock::new(),
            algos: OnceLock::new(),
            dispatch: OnceLock::new(),
        }
    }

    pub fn set_book(&self, book: Arc<OrderBook>) {
        let _ = self.book.set(book);
    }

    pub fn set_md(&self, md: Arc<MarketDataStore>) {
        let _ = self.md.set(md);
    }

    pub fn set_algos(&self, algos: &Arc<AlgoManager>) {
        let _ = self.algos.set(Arc::downgrade(algos));
    }

    pub fn set_dispatch(&self, dispatch: Arc<ExchangeDispatch>) {
        let _ = self.dispatch.set(dispatch);
    }

    fn security(&self, security_id: u32) -> Arc<CrossSecurity> {
        self.securities.entry(security_id).or_default().clone()
    }

    /// Resting queue depths (buys, sells) for one security.
    pub fn queue_sizes(&self, security_id: u32) -> (usize, usize) {
        self.securities
            .get(&security_id)
            .and_then(|s| s.inner.lock().ok().map(|q| (q.buys.len(), q.sells.len())))
            .unwrap_or((0, 0))
    }

    /// Enqueue a crossing order (already journaled as `unconfirmed_new`)
    /// and attempt matching.
    pub fn place(&self, ord: &Order) {
        debug_assert_eq!(ord.ord_type(), OrdType::Cx);
        let sec = self.security(ord.security_id());
        let mut actions = Vec::new();
        {
            let mut q = match sec.inner.lock() {
                Ok(q) => q,
                Err(q) => q.into_inner(),
            };
            let co = CrossOrder {
                order_id: ord.id,
                algo_id: ord.algo_id,
                instrument_id: ord.instrument_id,
                filled_in_market: 0.0,
                count: 0,
            };
            if ord.is_buy() {
                q.buys.push_back(co);
            } else {
                q.sells.push_back(co);
            }
            self.match_pass(&mut q, ord.security_id(), &mut actions);
        }
        self.run_actions(actions);
    }

    /// Reconcile an externally confirmed fill: market executions consume
    /// the resting cross quantity on the same instrument.
    pub fn update_trade(&self, cm: &Confirmation, ord: &Order) {
        if ord.ord_type() == OrdType::Cx || ord.instrument_id == 0 {
            return;
        }
        let Some(sec) = self.securities.get(&ord.security_id()).map(|s| s.clone()) else {
            return;
        };
        let mut q = match sec.inner.lock() {
            Ok(q) => q,
            Err(q) => q.into_inner(),
        };
        let orders = if ord.is_buy() { &mut q.buys } else { &mut q.sells };
        if let Some(pos) = orders
            .iter()
            .position(|co| co.instrument_id == ord.instrument_id)
        {
            orders[pos].filled_in_market += cm.last_shares;
            if self.order_leaves(&orders[pos]) <= 0.0 {
                orders.remove(pos);
            }
        }
    }

    fn is_active(&self, co: &CrossOrder) -> bool {
        if co.algo_id == 0 {
            return true;
        }
        match self.algos.get().and_then(Weak::upgrade) {
            Some(algos) => algos
                .algo_info(co.algo_id)
                .map(|a| a.is_active())
                .unwrap_or(false),
            None => true,
        }
    }

    fn order_leaves(&self, co: &CrossOrder) -> f64 {
        let book_leaves = self
            .book
            .get()
            .and_then(|b| b.get(co.order_id))
            .map(|o| o.leaves_qty)
            .unwrap_or(0.0);
        book_leaves - co.filled_in_market
    }

    /// Reference price for a match: midpoint of the sell-side instrument's
    /// best quote, falling back to the last trade, then the static close.
    fn reference_price(&self, sell: &CrossOrder, security_id: u32) -> f64 {
        let Some(md) = self.md.get() else { return 0.0 };
        let src = self
            .algos
            .get()
            .and_then(Weak::upgrade)
            .and_then(|a| a.instrument(sell.instrument_id))
            .map(|i| i.src)
            .or_else(|| md.default_feed().map(|f| f.src()))
            .unwrap_or(DataSrc(0));
        let snap = md.snapshot(src, security_id);
        let mut price = snap.mid();
        if price == 0.0 {
            price = snap.trade.close;
        }
        if price == 0.0 {
            price = self
                .catalog
                .security(security_id)
                .map(|s| s.close_price)
                .unwrap_or(0.0);
        }
        price
    }

    fn match_pass(&self, q: &mut Queues, security_id: u32, actions: &mut Vec<Action>) {
        // Fills are deferred, so track quantity matched in this pass
        // separately from the book's (not yet updated) leaves.
        let mut emitted: HashMap<u32, f64> = HashMap::new();
        let leaves = |this: &Self, co: &CrossOrder, emitted: &HashMap<u32, f64>| {
            this.order_leaves(co) - emitted.get(&co.order_id).copied().unwrap_or(0.0)
        };
        loop {
            while let Some(b) = q.buys.front() {
                if !self.is_active(b) || leaves(self, b, &emitted) <= 0.0 {
                    q.buys.pop_front();
                } else {
                    break;
                }
            }
            while let Some(s) = q.sells.front() {
                if !self.is_active(s) || leaves(self, s, &emitted) <= 0.0 {
                    q.sells.pop_front();
                } else {
                    break;
                }
            }
            let (Some(buy), Some(sell)) = (q.buys.front(), q.sells.front()) else {
                break;
            };

            let price = self.reference_price(sell, security_id);
            if price <= 0.0 {
                // No reference price yet; wait for data.
                debug!("no reference price for cross on security {security_id}, waiting");
                break;
            }
            let m = leaves(self, buy, &emitted).min(leaves(self, sell, &emitted));
            if m <= 0.0 {
                break;
            }

            let buy_id = buy.order_id;
            let sell_id = sell.order_id;
            actions.push(Action::CancelInstrument(sell.instrument_id));
            actions.push(Action::CancelInstrument(buy.instrument_id));
            if let Some(sell) = q.sells.front_mut() {
                actions.push(Action::Fill {
                    order_id: sell_id,
                    qty: m,
                    price,
                    exec_id: format!("CX-{}-{}", sell_id, sell.count),
                });
                sell.count += 1;
            }
            if let Some(buy) = q.buys.front_mut() {
                actions.push(Action::Fill {
                    order_id: buy_id,
                    qty: m,
                    price,
                    exec_id: format!("CX-{}-{}", buy_id, buy.count),
                });
                buy.count += 1;
            }
            *emitted.entry(buy_id).or_default() += m;
            *emitted.entry(sell_id).or_default() += m;
        }
    }

    fn run_actions(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::CancelInstrument(inst_id) => {
                    if let Some(algos) = self.algos.get().and_then(Weak::upgrade) {
                        if let Some(inst) = algos.instrument(inst_id) {
                            algos.cancel_instrument(&inst);
                        }
                    }
                }
                Action::Fill {
                    order_id,
                    qty,
                    price,
                    exec_id,
                } => {
                    if let Some(dispatch) = self.dispatch.get() {
                        dispatch.handle_filled(order_id, qty, price, &exec_id);
                    }
                }
            }
        }
    }
}
