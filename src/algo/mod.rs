//! The algorithm runtime: per-algo lifecycle, sharded single-threaded
//! workers with per-algo affinity, market-data notification, timers and
//! confirmation dispatch.
//!
//! Every callback of an algo runs on the shard `algo_id % N`; within a
//! shard callbacks run to completion, across shards they run in parallel.
//! Panics in callbacks are caught at the shard boundary; a failing
//! `on_start` stops the algo.

mod instrument;
mod runtime;
pub mod twap;

pub use instrument::Instrument;

use crate::catalog::Catalog;
use crate::consolidation::{ConsolidationBook, ConsolidationManager};
use crate::cross::CrossEngine;
use crate::dispatch::ExchangeDispatch;
use crate::marketdata::{DataSrc, MarketDataStore, MdSnapshot};
use crate::orderbook::{
    Confirmation, Contract, Journal, JournalError, OrdType, Order, OrderBook, OrderStatus, Side,
};
use dashmap::DashMap;
use runtime::{Shard, ShardState};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Parameters handed to `on_start`/`on_modify`: the decoded JSON object the
/// client submitted.
pub type AlgoParams = serde_json::Map<String, serde_json::Value>;

/// Factory registered per algo name. Compile-time registry in place of
/// shared-object loading.
pub type AlgoFactory = Arc<dyn Fn() -> Box<dyn Algo> + Send + Sync>;

/// A trading strategy. All methods run on the algo's shard; they must not
/// block on network or disk — long waits go through `set_timeout`.
pub trait Algo: Send {
    /// Validate params and set up subscriptions/orders. A non-empty error
    /// stops the algo immediately.
    fn on_start(&mut self, ctx: &AlgoCtx, params: &AlgoParams) -> Result<(), String>;
    fn on_modify(&mut self, _ctx: &AlgoCtx, _params: &AlgoParams) {}
    fn on_stop(&mut self, _ctx: &AlgoCtx) {}
    fn on_market_trade(
        &mut self,
        _ctx: &AlgoCtx,
        _inst: &Arc<Instrument>,
        _md: &MdSnapshot,
        _prev: &MdSnapshot,
    ) {
    }
    fn on_market_quote(
        &mut self,
        _ctx: &AlgoCtx,
        _inst: &Arc<Instrument>,
        _md: &MdSnapshot,
        _prev: &MdSnapshot,
    ) {
    }
    /// Order confirmations for this algo's orders. Cross orders see only
    /// `unconfirmed_new` and fills.
    fn on_confirmation(&mut self, _ctx: &AlgoCtx, _cm: &Confirmation, _ord: &Order) {}
    /// Timer callback for a token passed to [`AlgoCtx::set_timeout`].
    fn on_timer(&mut self, _ctx: &AlgoCtx, _token: u64) {}
}

/// Shared, shard-independent state of a spawned algo.
pub struct AlgoInfo {
    pub id: u32,
    pub name: String,
    pub user_id: u16,
    pub token: String,
    active: AtomicBool,
    instruments: Mutex<Vec<Arc<Instrument>>>,
}

impl AlgoInfo {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn instruments(&self) -> Vec<Arc<Instrument>> {
        self.instruments.lock().map(|i| i.clone()).unwrap_or_default()
    }
}

/// One replayed algo-journal event.
#[derive(Debug, Clone, PartialEq)]
pub struct AlgoEvent {
    pub seq: u32,
    pub algo_id: u32,
    pub user_id: u16,
    pub tm: i64,
    pub name: String,
    pub status: String,
    pub body: String,
}

/// The capability surface a callback uses to act on the platform.
pub struct AlgoCtx {
    mgr: Arc<AlgoManager>,
    pub info: Arc<AlgoInfo>,
}

impl AlgoCtx {
    pub fn is_active(&self) -> bool {
        self.info.is_active()
    }

    pub fn algo_id(&self) -> u32 {
        self.info.id
    }

    pub fn catalog(&self) -> &Catalog {
        &self.mgr.catalog
    }

    /// Subscribe this algo to (security, source); returns the instrument
    /// carrying its accounting. The source actually serving the data may
    /// differ from the requested one (routing).
    pub fn subscribe(&self, security_id: u32, src: DataSrc) -> Result<Arc<Instrument>, String> {
        let sec = self
            .mgr
            .catalog
            .security(security_id)
            .ok_or_else(|| format!("unknown security {security_id}"))?;
        let actual = self.mgr.md.subscribe(&sec, src).unwrap_or(src);
        let inst = Arc::new(Instrument::new(
            self.mgr.inst_id_counter.fetch_add(1, Ordering::Relaxed) + 1,
            self.info.id,
            security_id,
            actual,
        ));
        self.mgr.instruments.insert(inst.id, inst.clone());
        if let Ok(mut insts) = self.info.instruments.lock() {
            insts.push(inst.clone());
        }
        self.mgr.register_instrument(inst.clone());
        Ok(inst)
    }

    /// Get (creating if needed) the consolidation book for a security.
    /// Smart-route algos combine this with per-source subscriptions.
    pub fn consolidation(&self, security_id: u32) -> Result<Arc<ConsolidationBook>, String> {
        let cons = self
            .mgr
            .consolidation
            .get()
            .ok_or_else(|| "consolidation not wired".to_string())?;
        Ok(cons.subscribe(security_id))
    }

    /// Place a child order through dispatch; instrument accounting is
    /// updated on acceptance.
    pub fn place(&self, mut contract: Contract, inst: &Arc<Instrument>) -> Result<u32, String> {
        if !self.info.is_active() {
            return Err("algo is not active".to_string());
        }
        contract.security_id = inst.security_id;
        let is_buy = contract.side.is_buy();
        let qty = contract.qty;
        let mut ord = Order::from_contract(contract, self.info.user_id);
        ord.algo_id = self.info.id;
        ord.instrument_id = inst.id;
        let id = self.mgr.dispatch()?.place(ord)?;
        inst.add_order(id);
        inst.add_outstanding(is_buy, qty);
        Ok(id)
    }

    /// Look up an order snapshot in the global book.
    pub fn order(&self, order_id: u32) -> Option<Order> {
        self.mgr.book.get().and_then(|b| b.get(order_id))
    }

    /// Cancel one of this algo's live orders.
    pub fn cancel(&self, order_id: u32) -> Result<u32, String> {
        let book = self.mgr.book()?;
        let ord = book
            .get(order_id)
            .ok_or_else(|| format!("unknown order {order_id}"))?;
        self.mgr.dispatch()?.cancel(&ord)
    }

    /// Cancel every live order on an instrument.
    pub fn cancel_instrument(&self, inst: &Arc<Instrument>) {
        self.mgr.cancel_instrument(inst);
    }

    /// Submit an internal crossing order at the given reference price
    /// preference (0 = engine picks mid/last/close).
    pub fn cross(
        &self,
        qty: f64,
        price: f64,
        side: Side,
        sub_account_id: u16,
        inst: &Arc<Instrument>,
    ) -> Result<u32, String> {
        if !self.info.is_active() {
            return Err("algo is not active".to_string());
        }
        let cross = self
            .mgr
            .cross
            .get()
            .ok_or_else(|| "cross engine not wired".to_string())?;
        let book = self.mgr.book()?;
        let mut ord = Order::from_contract(
            Contract {
                security_id: inst.security_id,
                sub_account_id,
                qty,
                price,
                side,
                ord_type: OrdType::Cx,
                ..Default::default()
            },
            self.info.user_id,
        );
        ord.algo_id = self.info.id;
        ord.instrument_id = inst.id;
        if let (Some(sec), Some(sub)) = (
            self.mgr.catalog.security(inst.security_id),
            self.mgr.catalog.sub_account(sub_account_id),
        ) {
            ord.broker_account_id = sub.broker_account_for(sec.exchange_id).unwrap_or(0);
        }
        ord.id = book.new_order_id();
        ord.leaves_qty = qty;
        ord.tm = crate::utils::now_micros();
        book.insert(ord.clone());
        book.handle(Confirmation::status(
            ord.id,
            OrderStatus::UnconfirmedNew,
            "",
            ord.tm,
        ));
        cross.place(&ord);
        Ok(ord.id)
    }

    /// Schedule `on_timer(token)` on this algo's shard after `seconds`.
    /// Timers carry no cancellation handle; a stopped algo's timer fires
    /// into the inactive check and returns.
    pub fn set_timeout(&self, token: u64, seconds: f64) {
        self.mgr
            .set_timeout(self.info.id, token, seconds);
    }

    /// Current market data for an instrument.
    pub fn md(&self, inst: &Arc<Instrument>) -> MdSnapshot {
        self.mgr.md.snapshot(inst.src, inst.security_id)
    }

    /// Stop this algo (posted; runs after the current callback returns).
    pub fn stop(&self) {
        self.mgr.stop(self.info.id);
    }
}

/// The algo manager: registry, index, shards, journal.
pub struct AlgoManager {
    catalog: Arc<Catalog>,
    md: Arc<MarketDataStore>,
    registry: DashMap<String, AlgoFactory>,
    algos: DashMap<u32, Arc<AlgoInfo>>,
    algo_of_token: DashMap<String, u32>,
    instruments: DashMap<u64, Arc<Instrument>>,
    md_refs: DashMap<(u32, u32), u32>,
    id_counter: AtomicU32,
    inst_id_counter: AtomicU64,
    journal: Journal,
    shards: OnceLock<Vec<Shard>>,
    counters_mutex: Mutex<()>,
    self_weak: OnceLock<Weak<AlgoManager>>,
    dispatch: OnceLock<Arc<ExchangeDispatch>>,
    cross: OnceLock<Arc<CrossEngine>>,
    consolidation: OnceLock<Arc<ConsolidationManager>>,
    book: OnceLock<Arc<OrderBook>>,
    tokio_handle: OnceLock<tokio::runtime::Handle>,
}

impl AlgoManager {
    /// Open the algo journal and restore counters. Algo ids and the journal
    /// sequence roll forward by 100 to avoid racing in-flight confirmations
    /// from a previous run.
    pub fn open(
        catalog: Arc<Catalog>,
        md: Arc<MarketDataStore>,
        store_dir: &Path,
    ) -> Result<Self, JournalError> {
        let (journal, scan) = Journal::open(&store_dir.join("algos"))?;
        journal.advance_seq(100);
        let id0 = scan.max_order_id + 100;
        info!("algo id starts from {id0}");
        Ok(Self {
            catalog,
            md,
            registry: DashMap::new(),
            algos: DashMap::new(),
            algo_of_token: DashMap::new(),
            instruments: DashMap::new(),
            md_refs: DashMap::new(),
            id_counter: AtomicU32::new(id0),
            inst_id_counter: AtomicU64::new(0),
            journal,
            shards: OnceLock::new(),
            counters_mutex: Mutex::new(()),
            self_weak: OnceLock::new(),
            dispatch: OnceLock::new(),
            cross: OnceLock::new(),
            consolidation: OnceLock::new(),
            book: OnceLock::new(),
            tokio_handle: OnceLock::new(),
        })
    }

    // ── Wiring ────────────────────────────────────────────────────────────

    pub fn set_dispatch(&self, dispatch: Arc<ExchangeDispatch>) {
        let _ = self.dispatch.set(dispatch);
    }

    pub fn set_cross(&self, cross: Arc<CrossEngine>) {
        let _ = self.cross.set(cross);
    }

    pub fn set_consolidation(&self, cons: Arc<ConsolidationManager>) {
        let _ = self.consolidation.set(cons);
    }

    pub fn set_book(&self, book: Arc<OrderBook>) {
        let _ = self.book.set(book);
    }

    pub fn set_runtime(&self, handle: tokio::runtime::Handle) {
        let _ = self.tokio_handle.set(handle);
    }

    fn dispatch(&self) -> Result<Arc<ExchangeDispatch>, String> {
        self.dispatch
            .get()
            .cloned()
            .ok_or_else(|| "dispatch not wired".to_string())
    }

    fn book(&self) -> Result<Arc<OrderBook>, String> {
        self.book
            .get()
            .cloned()
            .ok_or_else(|| "order book not wired".to_string())
    }

    /// Start the worker pool. At least one shard always runs.
    pub fn start(self: &Arc<Self>, nthreads: usize) {
        let _ = self.self_weak.set(Arc::downgrade(self));
        let n = nthreads.max(1);
        info!("algo_threads={n}");
        let _ = self
            .shards
            .set((0..n).map(Shard::spawn).collect());
    }

    fn self_arc(&self) -> Option<Arc<AlgoManager>> {
        self.self_weak.get().and_then(Weak::upgrade)
    }

    fn shards(&self) -> &[Shard] {
        self.shards.get().map(Vec::as_slice).unwrap_or(&[])
    }

    fn shard_of(&self, algo_id: u32) -> Option<&Shard> {
        let shards = self.shards();
        if shards.is_empty() {
            None
        } else {
            Some(&shards[algo_id as usize % shards.len()])
        }
    }

    // ── Registry & lookup ─────────────────────────────────────────────────

    /// Register an algo factory by name.
    pub fn register_algo(&self, name: &str, factory: AlgoFactory) {
        self.registry.insert(name.to_string(), factory);
    }

    pub fn known_algos(&self) -> Vec<String> {
        self.registry.iter().map(|e| e.key().clone()).collect()
    }

    pub fn algo_info(&self, id: u32) -> Option<Arc<AlgoInfo>> {
        self.algos.get(&id).map(|a| a.clone())
    }

    pub fn algo_by_token(&self, token: &str) -> Option<Arc<AlgoInfo>> {
        self.algo_of_token
            .get(token)
            .and_then(|id| self.algo_info(*id))
    }

    fn algo_active(&self, id: u32) -> bool {
        self.algos.get(&id).map(|a| a.is_active()).unwrap_or(false)
    }

    pub fn instrument(&self, id: u64) -> Option<Arc<Instrument>> {
        self.instruments.get(&id).map(|i| i.clone())
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Spawn an algo instance by registered name. Posts `on_start` to its
    /// shard; a failing start stops the algo.
    pub fn spawn(
        &self,
        name: &str,
        params: AlgoParams,
        user_id: u16,
        token: &str,
    ) -> Result<u32, String> {
        let factory = self
            .registry
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| format!("unknown algo: {name}"))?;
        let id = self.id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let info = Arc::new(AlgoInfo {
            id,
            name: name.to_string(),
            user_id,
            token: token.to_string(),
            active: AtomicBool::new(true),
            instruments: Mutex::new(Vec::new()),
        });
        self.algos.insert(id, info.clone());
        if !token.is_empty() {
            self.algo_of_token.insert(token.to_string(), id);
        }
        let params_raw =
            serde_json::to_string(&params).unwrap_or_else(|_| "{}".to_string());
        self.persist(&info, "new", &params_raw);

        let mgr = self.self_arc().ok_or_else(|| "runtime not started".to_string())?;
        let shard = self
            .shard_of(id)
            .ok_or_else(|| "runtime not started".to_string())?;
        shard.post(Box::new(move |state| {
            let mut algo = factory();
            let ctx = AlgoCtx {
                mgr: mgr.clone(),
                info: info.clone(),
            };
            let started = catch_unwind(AssertUnwindSafe(|| algo.on_start(&ctx, &params)));
            state.algos.insert(info.id, algo);
            match started {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("algo {} failed to start: {e}", info.id);
                    do_stop(state, &mgr, info.id, Some(e));
                }
                Err(_) => {
                    error!("algo {} panicked in on_start", info.id);
                    do_stop(state, &mgr, info.id, Some("panic in on_start".to_string()));
                }
            }
        }));
        Ok(id)
    }

    /// Post `on_modify` with fresh params.
    pub fn modify(&self, algo_id: u32, params: AlgoParams) {
        let Some(info) = self.algo_info(algo_id) else { return };
        let Some(mgr) = self.self_arc() else { return };
        if let Some(shard) = self.shard_of(algo_id) {
            shard.post(Box::new(move |state| {
                if let Some(algo) = state.algos.get_mut(&info.id) {
                    let ctx = AlgoCtx {
                        mgr: mgr.clone(),
                        info: info.clone(),
                    };
                    let _ = catch_unwind(AssertUnwindSafe(|| algo.on_modify(&ctx, &params)));
                }
            }));
        }
    }

    /// Stop one algo: cancels its live orders, journals the terminal
    /// record, then invokes `on_stop` on its shard.
    pub fn stop(&self, algo_id: u32) {
        let Some(mgr) = self.self_arc() else { return };
        if let Some(shard) = self.shard_of(algo_id) {
            shard.post(Box::new(move |state| {
                do_stop(state, &mgr, algo_id, None);
            }));
        }
    }

    pub fn stop_by_token(&self, token: &str) {
        if let Some(info) = self.algo_by_token(token) {
            self.stop(info.id);
        }
    }

    /// Stop every algo holding an instrument on the given security.
    pub fn stop_security(&self, security_id: u32) {
        for entry in self.algos.iter() {
            let info = entry.value();
            if info.is_active()
                && info
                    .instruments()
                    .iter()
                    .any(|i| i.security_id == security_id)
            {
                self.stop(info.id);
            }
        }
    }

    /// Stop everything (graceful shutdown).
    pub fn stop_all(&self) {
        for entry in self.algos.iter() {
            if entry.value().is_active() {
                self.stop(*entry.key());
            }
        }
    }

    /// Wait until every shard drained its queue. Two passes, so work queued
    /// by the drained tasks themselves (timers, confirmation callbacks) has
    /// also run.
    pub fn quiesce(&self) {
        for _ in 0..2 {
            for shard in self.shards() {
                shard.post_and_wait(Box::new(|_| {}));
            }
        }
    }

    /// Cancel every live order on an instrument through dispatch.
    pub fn cancel_instrument(&self, inst: &Arc<Instrument>) {
        let (Ok(dispatch), Ok(book)) = (self.dispatch(), self.book()) else {
            return;
        };
        for oid in inst.active_orders() {
            if let Some(ord) = book.get(oid) {
                if ord.is_live() {
                    if let Err(e) = dispatch.cancel(&ord) {
                        debug!("cancel of order {oid} failed: {e}");
                    }
                }
            }
        }
    }

    // ── Market-data notification ──────────────────────────────────────────

    /// Whether any shard subscribes to (src, security).
    pub fn is_subscribed(&self, src: DataSrc, security_id: u32) -> bool {
        self.md_refs
            .get(&(src.0, security_id))
            .map(|n| *n > 0)
            .unwrap_or(false)
    }

    /// Mark (src, security) dirty on every shard holding subscribers and
    /// post the drain task to shards whose dirty set was empty.
    pub fn touch(&self, src: DataSrc, security_id: u32) {
        let key = (src.0, security_id);
        let Some(mgr) = self.self_arc() else { return };
        for shard in self.shards() {
            let has_refs = shard.refs.get(&key).map(|n| *n > 0).unwrap_or(false);
            if !has_refs {
                continue;
            }
            let should_post = {
                let mut dirty = match shard.dirty.lock() {
                    Ok(d) => d,
                    Err(d) => d.into_inner(),
                };
                let was_empty = dirty.is_empty();
                dirty.insert(key);
                was_empty
            };
            if should_post {
                let mgr = mgr.clone();
                let dirty = shard.dirty.clone();
                let refs = shard.refs.clone();
                shard.post(Box::new(move |state| {
                    drain_dirty(&mgr, &dirty, &refs, state);
                }));
            }
        }
    }

    /// Register a freshly subscribed instrument on its algo's shard.
    fn register_instrument(&self, inst: Arc<Instrument>) {
        let key = (inst.src.0, inst.security_id);
        *self.md_refs.entry(key).or_insert(0) += 1;
        let Some(mgr) = self.self_arc() else { return };
        if let Some(shard) = self.shard_of(inst.algo_id) {
            *shard.refs.entry(key).or_insert(0) += 1;
            shard.post(Box::new(move |state| {
                let entry = state.subs.entry(key).or_default();
                if entry.instruments.is_empty() {
                    entry.prev = mgr.md.snapshot(inst.src, inst.security_id);
                }
                entry.instruments.push(inst);
            }));
        }
    }

    fn release_md_refs(&self, key: (u32, u32), n: u32) {
        if let Some(mut refs) = self.md_refs.get_mut(&key) {
            *refs = refs.saturating_sub(n);
        }
    }

    // ── Confirmations ─────────────────────────────────────────────────────

    /// Apply instrument accounting inside the global handler's critical
    /// section, then dispatch the callback to the owning shard.
    pub fn handle(&self, cm: &Confirmation, ord: &Order) {
        if ord.algo_id == 0 || ord.instrument_id == 0 {
            return;
        }
        let Some(inst) = self.instrument(ord.instrument_id) else {
            return;
        };
        let is_buy = ord.is_buy();
        let is_cx = ord.ord_type() == OrdType::Cx;
        {
            let _guard = self.counters_mutex.lock();
            match cm.exec_type {
                OrderStatus::PartiallyFilled | OrderStatus::Filled => match cm.exec_trans_type {
                    crate::orderbook::ExecTransType::New => {
                        if is_cx {
                            inst.apply_cx_fill(is_buy, cm.last_shares);
                        } else {
                            inst.apply_fill(is_buy, cm.last_shares);
                        }
                    }
                    crate::orderbook::ExecTransType::Cancel => {
                        inst.apply_bust(is_buy, cm.last_shares);
                    }
                    _ => return,
                },
                s if s.releases_leaves() => {
                    if !is_cx {
                        inst.release_outstanding(is_buy, cm.leaves_qty);
                    }
                }
                OrderStatus::UnconfirmedNew
                | OrderStatus::UnconfirmedCancel
                | OrderStatus::PendingCancel
                | OrderStatus::CancelRejected
                | OrderStatus::PendingNew
                | OrderStatus::New
                | OrderStatus::Suspended
                | OrderStatus::RiskRejected => {}
                _ => return,
            }
        }

        let Some(mgr) = self.self_arc() else { return };
        let Some(shard) = self.shard_of(ord.algo_id) else { return };
        let cm = cm.clone();
        let ord = ord.clone();
        shard.post(Box::new(move |state| {
            if !ord.is_live() {
                inst.remove_order(ord.id);
            }
            let Some(info) = mgr.algo_info(ord.algo_id) else {
                return;
            };
            if let Some(algo) = state.algos.get_mut(&ord.algo_id) {
                let ctx = AlgoCtx {
                    mgr: mgr.clone(),
                    info,
                };
                let _ =
                    catch_unwind(AssertUnwindSafe(|| algo.on_confirmation(&ctx, &cm, &ord)));
            }
        }));
    }

    // ── Timers ────────────────────────────────────────────────────────────

    /// Deliver `on_timer(token)` on the algo's shard after `seconds`.
    pub fn set_timeout(&self, algo_id: u32, token: u64, seconds: f64) {
        let Some(mgr) = self.self_arc() else { return };
        let fire = move || {
            if let Some(shard) = mgr.shard_of(algo_id) {
                let mgr = mgr.clone();
                shard.post(Box::new(move |state| {
                    let Some(info) = mgr.algo_info(algo_id) else { return };
                    if !info.is_active() {
                        return;
                    }
                    if let Some(algo) = state.algos.get_mut(&algo_id) {
                        let ctx = AlgoCtx {
                            mgr: mgr.clone(),
                            info,
                        };
                        let _ = catch_unwind(AssertUnwindSafe(|| algo.on_timer(&ctx, token)));
                    }
                }));
            }
        };
        if seconds <= 0.0 {
            fire();
            return;
        }
        match self.tokio_handle.get() {
            Some(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                    fire();
                });
            }
            None => {
                debug!("no timer pool attached, timer fires immediately");
                fire();
            }
        }
    }

    // ── Journal ───────────────────────────────────────────────────────────

    /// Journal one lifecycle record: `"<tm> <name> <status> <body>"`.
    fn persist(&self, info: &AlgoInfo, status: &str, body: &str) {
        let payload = format!(
            "{} {} {} {}",
            crate::utils::now_secs(),
            info.name,
            status,
            body
        );
        self.journal
            .append(info.user_id, info.id, payload.as_bytes());
    }

    /// Replay journaled algo events at or past `seq0` for a user.
    pub fn replay(
        &self,
        seq0: u32,
        user_id: u16,
        is_admin: bool,
        mut f: impl FnMut(&AlgoEvent),
    ) -> Result<(), JournalError> {
        self.journal.replay(seq0, user_id, is_admin, |rec| {
            let payload = String::from_utf8_lossy(&rec.payload);
            let mut parts = payload.splitn(4, ' ');
            let tm = parts.next().and_then(|t| t.parse().ok()).unwrap_or(0);
            let name = parts.next().unwrap_or("").to_string();
            let status = parts.next().unwrap_or("").to_string();
            let body = parts.next().unwrap_or("").to_string();
            if name.is_empty() || status.is_empty() {
                warn!("unparseable algo journal record seq {}", rec.seq);
                return;
            }
            f(&AlgoEvent {
                seq: rec.seq,
                algo_id: rec.order_id,
                user_id: rec.user_id,
                tm,
                name,
                status,
                body,
            });
        })
    }

    pub fn seq(&self) -> u32 {
        self.journal.seq()
    }

    pub fn sync_journal(&self) {
        self.journal.flush();
    }
}

/// Stop an algo on its own shard: flips the flag, cancels live orders,
/// journals the terminal record and invokes `on_stop`.
fn do_stop(state: &mut ShardState, mgr: &Arc<AlgoManager>, algo_id: u32, err: Option<String>) {
    let Some(info) = mgr.algo_info(algo_id) else {
        return;
    };
    if !info.active.swap(false, Ordering::AcqRel) {
        return;
    }
    for inst in info.instruments() {
        mgr.cancel_instrument(&inst);
    }
    match &err {
        Some(e) => mgr.persist(&info, "failed", e),
        None => mgr.persist(&info, "terminated", ""),
    }
    if let Some(mut algo) = state.algos.remove(&algo_id) {
        let ctx = AlgoCtx {
            mgr: mgr.clone(),
            info,
        };
        let _ = catch_unwind(AssertUnwindSafe(|| algo.on_stop(&ctx)));
    }
}

/// Drain a shard's dirty set: snapshot, diff against the shard-local
/// previous value and invoke the market-data callbacks on each still-active
/// instrument. Inactive instruments unlink lazily and count their
/// references down.
fn drain_dirty(
    mgr: &Arc<AlgoManager>,
    dirty: &Arc<Mutex<std::collections::HashSet<(u32, u32)>>>,
    refs: &Arc<DashMap<(u32, u32), u32>>,
    state: &mut ShardState,
) {
    loop {
        let key = {
            let mut d = match dirty.lock() {
                Ok(d) => d,
                Err(d) => d.into_inner(),
            };
            match d.iter().next().copied() {
                Some(k) => {
                    d.remove(&k);
                    k
                }
                None => break,
            }
        };
        let md = mgr.md.snapshot(DataSrc(key.0), key.1);
        let (instruments, prev, trade_update, quote_update) = {
            let entry = state.subs.entry(key).or_default();
            let trade_update = md.trade.changed(&entry.prev.trade);
            let quote_update = *md.quote() != *entry.prev.quote();
            let before = entry.instruments.len();
            entry.instruments.retain(|inst| mgr.algo_active(inst.algo_id));
            let removed = (before - entry.instruments.len()) as u32;
            if removed > 0 {
                if let Some(mut n) = refs.get_mut(&key) {
                    *n = n.saturating_sub(removed);
                }
                mgr.release_md_refs(key, removed);
            }
            let prev = entry.prev;
            entry.prev = md;
            (entry.instruments.clone(), prev, trade_update, quote_update)
        };
        if !trade_update && !quote_update {
            continue;
        }
        for inst in instruments {
            let Some(info) = mgr.algo_info(inst.algo_id) else {
                continue;
            };
            if !info.is_active() {
                continue;
            }
            if let Some(algo) = state.algos.get_mut(&inst.algo_id) {
                let ctx = AlgoCtx {
                    mgr: mgr.clone(),
                    info,
                };
                if trade_update {
                    let _ = catch_unwind(AssertUnwindSafe(|| {
                        algo.on_market_trade(&ctx, &inst, &md, &prev)
                    }));
                }
                if quote_update {
                    let _ = catch_unwind(AssertUnwindSafe(|| {
                        algo.on_market_quote(&ctx, &inst, &md, &prev)
                    }));
                }
            }
        }
    }
}
