//! Position and PnL accounting.
//!
//! Every confirmation is applied identically at three aggregation scopes
//! (sub-account, broker-account, user) plus the per-account notional
//! aggregates that back the account-global risk limits. Fills additionally
//! produce a durable position row on a dedicated writer.

mod commission;
mod store;

pub use commission::{CommissionAdapter, CommissionManager, CommissionRates, SideRates};
pub use store::{load_or_create_session, BodRow, PositionRow, PositionStore, SessionInfo, StoreError};

use crate::catalog::Catalog;
use crate::orderbook::{Confirmation, ExecTransType, Order, OrderStatus};
use crate::utils::round6;
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Gross notional aggregates used by account-level limits.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PositionValue {
    pub total_bought: f64,
    pub total_sold: f64,
    pub total_outstanding_buy: f64,
    pub total_outstanding_sell: f64,
    /// Gross long/short marks rebuilt on the PnL cadence, projected with
    /// outstanding quantities.
    pub long_value: f64,
    pub short_value: f64,
}

impl PositionValue {
    /// A new outstanding order enters the book.
    pub fn handle_new(&mut self, is_buy: bool, qty: f64, price: f64, multiplier: f64, is_fx: bool) {
        let price = if is_fx { 1.0 } else { price };
        let value = qty * price * multiplier;
        if is_buy {
            self.total_outstanding_buy += value;
        } else {
            self.total_outstanding_sell += value;
        }
    }

    /// A fill (or bust) converts outstanding notional into traded notional.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_trade(
        &mut self,
        is_buy: bool,
        qty: f64,
        price: f64,
        price0: f64,
        multiplier: f64,
        is_bust: bool,
        is_otc: bool,
        is_fx: bool,
    ) {
        let (price, price0) = if is_fx { (1.0, 1.0) } else { (price, price0) };
        let signed_qty = if is_buy { qty } else { -qty };
        let value = signed_qty * price * multiplier;
        if is_otc {
            // OTC/cross flow never had outstanding notional.
        } else if !is_bust {
            let value0 = signed_qty * price0 * multiplier;
            if value > 0.0 {
                self.total_outstanding_buy -= value0;
                self.total_bought += value;
            } else {
                self.total_outstanding_sell -= -value0;
                self.total_sold += -value;
            }
        } else if value > 0.0 {
            self.total_bought -= value;
        } else {
            self.total_sold -= -value;
        }
    }

    /// A terminal confirmation releases the remaining outstanding notional.
    pub fn handle_finish(
        &mut self,
        is_buy: bool,
        leaves_qty: f64,
        price0: f64,
        multiplier: f64,
        is_fx: bool,
    ) {
        if leaves_qty == 0.0 {
            return;
        }
        let price0 = if is_fx { 1.0 } else { price0 };
        let value = leaves_qty * price0 * multiplier;
        if is_buy {
            self.total_outstanding_buy -= value;
        } else {
            self.total_outstanding_sell -= value;
        }
    }
}

/// A position at one aggregation scope for one security.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub value: PositionValue,
    pub qty: f64,
    /// Internally crossed quantity (included in `qty`).
    pub cx_qty: f64,
    pub avg_px: f64,
    pub unrealized_pnl: f64,
    /// Realized PnL in account currency (native × multiplier × fx rate).
    pub realized_pnl: f64,
    /// Realized PnL in the security's native currency.
    pub realized_pnl_native: f64,
    pub commission: f64,
    pub commission_native: f64,
    // Intraday share totals.
    pub total_bought_qty: f64,
    pub total_sold_qty: f64,
    pub total_outstanding_buy_qty: f64,
    pub total_outstanding_sell_qty: f64,
}

/// Apply one signed trade to realized PnL and the average price.
///
/// Covering a position realizes `(price − avg_px) · matched`; flipping the
/// sign resets `avg_px` to the fill price for the residual; same-side adds
/// pool the average; a flat position resets `avg_px` to zero.
fn handle_pnl(qty: f64, price: f64, multiplier: f64, p: &mut Position) {
    let qty0 = p.qty;
    let mut pnl_chg = 0.0;
    if qty0 > 0.0 && qty < 0.0 {
        // Sell trade covering a long.
        if qty0 > -qty {
            pnl_chg = (price - p.avg_px) * -qty;
        } else {
            pnl_chg = (price - p.avg_px) * qty0;
            p.avg_px = price;
        }
    } else if qty0 < 0.0 && qty > 0.0 {
        // Buy trade covering a short.
        if -qty0 > qty {
            pnl_chg = (p.avg_px - price) * qty;
        } else {
            pnl_chg = (p.avg_px - price) * -qty0;
            p.avg_px = price;
        }
    } else if qty0 + qty != 0.0 {
        p.avg_px = (qty0 * p.avg_px + qty * price) / (qty0 + qty);
    }
    if qty0 + qty == 0.0 {
        p.avg_px = 0.0;
    }
    if pnl_chg != 0.0 {
        p.realized_pnl_native += pnl_chg;
        p.realized_pnl += pnl_chg * multiplier;
    }
}

impl Position {
    fn handle_new(&mut self, is_buy: bool, qty: f64, price: f64, multiplier: f64, is_fx: bool) {
        if is_buy {
            self.total_outstanding_buy_qty += qty;
        } else {
            self.total_outstanding_sell_qty += qty;
        }
        self.value.handle_new(is_buy, qty, price, multiplier, is_fx);
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_trade(
        &mut self,
        is_buy: bool,
        qty: f64,
        price: f64,
        price0: f64,
        multiplier: f64,
        is_bust: bool,
        is_otc: bool,
        is_cx: bool,
        is_fx: bool,
        commission: f64,
    ) {
        self.value
            .handle_trade(is_buy, qty, price, price0, multiplier, is_bust, is_otc, is_fx);
        if commission != 0.0 {
            self.commission_native += commission;
            self.commission += commission * multiplier;
        }
        let mut qty = if is_buy { qty } else { -qty };
        if is_otc {
            // OTC/cross flow never touched the outstanding counters.
        } else if !is_bust {
            if qty > 0.0 {
                self.total_outstanding_buy_qty -= qty;
                self.total_bought_qty += qty;
            } else {
                self.total_outstanding_sell_qty -= -qty;
                self.total_sold_qty += -qty;
            }
        } else if qty > 0.0 {
            self.total_bought_qty -= qty;
        } else {
            self.total_sold_qty -= -qty;
        }

        if is_bust {
            qty = -qty;
        }
        handle_pnl(qty, price, multiplier, self);
        self.qty = round6(self.qty + qty);
        if is_cx {
            self.cx_qty = round6(self.cx_qty + qty);
        }
    }

    fn handle_finish(&mut self, is_buy: bool, leaves_qty: f64, price0: f64, multiplier: f64, is_fx: bool) {
        if leaves_qty == 0.0 {
            return;
        }
        if is_buy {
            self.total_outstanding_buy_qty -= leaves_qty;
        } else {
            self.total_outstanding_sell_qty -= leaves_qty;
        }
        self.value
            .handle_finish(is_buy, leaves_qty, price0, multiplier, is_fx);
    }
}

/// Per-sub-account PnL snapshot pushed to clients and appended to the pnl
/// files.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pnl {
    pub unrealized: f64,
    pub commission: f64,
    pub realized: f64,
}

/// Target positions for a sub-account: security id → desired net quantity.
pub type Targets = HashMap<u32, f64>;

#[derive(Default)]
struct PnlTrack {
    last_written: Pnl,
    current: Pnl,
}

/// The position engine.
pub struct PositionManager {
    catalog: Arc<Catalog>,
    commissions: Arc<CommissionManager>,
    sub_positions: DashMap<(u16, u32), Position>,
    broker_positions: DashMap<(u16, u32), Position>,
    user_positions: DashMap<(u16, u32), Position>,
    sub_values: DashMap<u16, PositionValue>,
    broker_values: DashMap<u16, PositionValue>,
    user_values: DashMap<u16, PositionValue>,
    bods: DashMap<(u16, u32), BodRow>,
    targets: DashMap<u16, Arc<Targets>>,
    pnls: Mutex<HashMap<u16, PnlTrack>>,
    pnl_tick: AtomicU64,
    store: PositionStore,
    session: SessionInfo,
    store_dir: PathBuf,
    // Serializes confirmation application across all scopes.
    mutex: Mutex<()>,
}

/// Which aggregation scope to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Sub,
    Broker,
    User,
}

impl PositionManager {
    /// Open the store, load BOD baselines and target files.
    pub fn new(
        catalog: Arc<Catalog>,
        commissions: Arc<CommissionManager>,
        store_dir: &Path,
        db_path: &Path,
    ) -> Result<(Self, SessionInfo), StoreError> {
        let session = load_or_create_session(store_dir)?;
        let (store, bods) = PositionStore::open(db_path, &session.started_at)?;
        let mgr = Self {
            catalog,
            commissions,
            sub_positions: DashMap::new(),
            broker_positions: DashMap::new(),
            user_positions: DashMap::new(),
            sub_values: DashMap::new(),
            broker_values: DashMap::new(),
            user_values: DashMap::new(),
            bods: DashMap::new(),
            targets: DashMap::new(),
            pnls: Mutex::new(HashMap::new()),
            pnl_tick: AtomicU64::new(0),
            store,
            session: session.clone(),
            store_dir: store_dir.to_path_buf(),
            mutex: Mutex::new(()),
        };
        mgr.load_bods(bods);
        mgr.load_targets();
        Ok((mgr, session))
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    fn load_bods(&self, bods: Vec<BodRow>) {
        for bod in bods {
            let Some(sec) = self.catalog.security(bod.security_id) else {
                continue;
            };
            let factor = sec.value_factor();
            let mut p = Position {
                qty: bod.qty,
                cx_qty: bod.cx_qty,
                avg_px: bod.avg_px,
                realized_pnl_native: bod.realized_pnl,
                realized_pnl: bod.realized_pnl * factor,
                commission_native: bod.commission,
                commission: bod.commission * factor,
                ..Default::default()
            };
            // Roll the sub-account baseline into the broker and user scopes
            // with pooled averaging.
            for (map, acc) in [
                (&self.broker_positions, bod.broker_account_id),
                (&self.user_positions, bod.user_id),
            ] {
                let mut agg = map.entry((acc, bod.security_id)).or_default();
                agg.realized_pnl += p.realized_pnl;
                agg.realized_pnl_native += bod.realized_pnl;
                handle_pnl(p.qty, p.avg_px, factor, &mut *agg);
                let new_qty = round6(agg.qty + p.qty);
                agg.qty = new_qty;
                let new_cx = round6(agg.cx_qty + p.cx_qty);
                agg.cx_qty = new_cx;
            }
            p.unrealized_pnl = 0.0;
            self.bods
                .insert((bod.sub_account_id, bod.security_id), bod.clone());
            self.sub_positions
                .insert((bod.sub_account_id, bod.security_id), p);
        }
    }

    fn load_targets(&self) {
        for id in self.catalog.accounts.sub_account_ids() {
            let path = self.store_dir.join(format!("target-{id}.json"));
            if !path.exists() {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|s| {
                    if s.trim().is_empty() {
                        Ok(Targets::new())
                    } else {
                        serde_json::from_str::<Targets>(&s).map_err(|e| e.to_string())
                    }
                }) {
                Ok(t) => {
                    self.targets.insert(id, Arc::new(t));
                    info!("target file {} loaded", path.display());
                }
                Err(e) => warn!("failed to load {}: {e}", path.display()),
            }
        }
    }

    /// The beginning-of-day baseline carried into this session, if any.
    pub fn bod(&self, sub_account_id: u16, security_id: u32) -> Option<BodRow> {
        self.bods
            .get(&(sub_account_id, security_id))
            .map(|b| b.clone())
    }

    /// Read a position snapshot (zero when never traded).
    pub fn position(&self, scope: Scope, account_id: u16, security_id: u32) -> Position {
        let map = match scope {
            Scope::Sub => &self.sub_positions,
            Scope::Broker => &self.broker_positions,
            Scope::User => &self.user_positions,
        };
        map.get(&(account_id, security_id))
            .map(|p| *p)
            .unwrap_or_default()
    }

    /// Read an account-level notional aggregate.
    pub fn account_value(&self, scope: Scope, account_id: u16) -> PositionValue {
        let map = match scope {
            Scope::Sub => &self.sub_values,
            Scope::Broker => &self.broker_values,
            Scope::User => &self.user_values,
        };
        map.get(&account_id).map(|v| *v).unwrap_or_default()
    }

    /// Every sub-account position for one account, for the client snapshot.
    pub fn sub_positions_of(&self, account_id: u16) -> Vec<(u32, Position)> {
        self.sub_positions
            .iter()
            .filter(|e| e.key().0 == account_id)
            .map(|e| (e.key().1, *e.value()))
            .collect()
    }

    pub fn set_targets(&self, sub_account_id: u16, targets: Targets) -> Result<(), StoreError> {
        let path = self.store_dir.join(format!("target-{sub_account_id}.json"));
        let json = serde_json::to_string(&targets).unwrap_or_else(|_| "{}".to_string());
        std::fs::write(path, json)?;
        self.targets.insert(sub_account_id, Arc::new(targets));
        Ok(())
    }

    pub fn targets(&self, sub_account_id: u16) -> Option<Arc<Targets>> {
        self.targets.get(&sub_account_id).map(|t| t.clone())
    }

    /// Apply one confirmation at all three scopes.
    pub fn handle(&self, cm: &Confirmation, ord: &Order, offline: bool) {
        let Some(sec) = self.catalog.security(ord.security_id()) else {
            return;
        };
        let multiplier = sec.value_factor();
        let is_fx = sec.sec_type.is_fx();
        let is_buy = ord.is_buy();
        let is_otc = ord.ord_type().is_otc();
        let is_cx = ord.ord_type() == crate::orderbook::OrdType::Cx;
        let _guard = self.mutex.lock();

        match cm.exec_type {
            OrderStatus::PartiallyFilled | OrderStatus::Filled => {
                let is_bust = match cm.exec_trans_type {
                    ExecTransType::New => false,
                    ExecTransType::Cancel => true,
                    _ => return,
                };
                let qty = cm.last_shares;
                let px = cm.last_px;
                let px0 = ord.price();
                let mut commission = self
                    .catalog
                    .broker_account(ord.broker_account_id)
                    .and_then(|b| b.commission_adapter.clone())
                    .and_then(|name| self.commissions.get(&name))
                    .filter(|_| !is_cx)
                    .map(|a| a.compute(cm, ord, sec.exchange_id))
                    .unwrap_or(0.0);
                if is_bust {
                    commission = -commission;
                }

                let mut snapshot = Position::default();
                for (scope, map, acc) in [
                    (Scope::Sub, &self.sub_positions, ord.sub_account_id()),
                    (Scope::Broker, &self.broker_positions, ord.broker_account_id),
                    (Scope::User, &self.user_positions, ord.user_id),
                ] {
                    let mut pos = map.entry((acc, ord.security_id())).or_default();
                    pos.handle_trade(
                        is_buy, qty, px, px0, multiplier, is_bust, is_otc, is_cx, is_fx, commission,
                    );
                    if scope == Scope::Sub {
                        snapshot = *pos;
                    }
                }
                for (map, acc) in self.value_scopes(ord) {
                    map.entry(acc).or_default().handle_trade(
                        is_buy, qty, px, px0, multiplier, is_bust, is_otc, is_fx,
                    );
                }
                if !offline {
                    self.persist(cm, ord, &snapshot, is_bust, is_otc, is_cx);
                }
            }
            OrderStatus::UnconfirmedNew => {
                if !is_otc {
                    let qty = ord.qty();
                    let px = ord.price();
                    for (map, acc) in self.position_scopes(ord) {
                        map.entry((acc, ord.security_id()))
                            .or_default()
                            .handle_new(is_buy, qty, px, multiplier, is_fx);
                    }
                    for (map, acc) in self.value_scopes(ord) {
                        map.entry(acc)
                            .or_default()
                            .handle_new(is_buy, qty, px, multiplier, is_fx);
                    }
                }
            }
            s if s.releases_leaves() || s == OrderStatus::RiskRejected => {
                if !is_otc {
                    let leaves = cm.leaves_qty;
                    let px0 = ord.price();
                    for (map, acc) in self.position_scopes(ord) {
                        map.entry((acc, ord.security_id()))
                            .or_default()
                            .handle_finish(is_buy, leaves, px0, multiplier, is_fx);
                    }
                    for (map, acc) in self.value_scopes(ord) {
                        map.entry(acc)
                            .or_default()
                            .handle_finish(is_buy, leaves, px0, multiplier, is_fx);
                    }
                }
            }
            _ => {}
        }
    }

    fn position_scopes(&self, ord: &Order) -> [(&DashMap<(u16, u32), Position>, u16); 3] {
        [
            (&self.sub_positions, ord.sub_account_id()),
            (&self.broker_positions, ord.broker_account_id),
            (&self.user_positions, ord.user_id),
        ]
    }

    fn value_scopes(&self, ord: &Order) -> [(&DashMap<u16, PositionValue>, u16); 3] {
        [
            (&self.sub_values, ord.sub_account_id()),
            (&self.broker_values, ord.broker_account_id),
            (&self.user_values, ord.user_id),
        ]
    }

    fn persist(
        &self,
        cm: &Confirmation,
        ord: &Order,
        pos: &Position,
        is_bust: bool,
        is_otc: bool,
        is_cx: bool,
    ) {
        let mut info = json!({
            "tm": cm.transaction_time,
            "qty": cm.last_shares,
            "px": cm.last_px,
            "exec_id": cm.exec_id,
            "side": ord.contract.side.code().to_string(),
            "type": ord.ord_type().code().to_string(),
            "id": ord.id,
        });
        if let Some(dest) = &ord.contract.destination {
            info["destination"] = json!(dest);
        }
        if let Some(attrs) = &ord.contract.attrs {
            for (k, v) in attrs {
                info[k.as_str()] = json!(v);
            }
        }
        if is_bust {
            info["bust"] = json!(true);
        }
        if is_otc && !is_cx {
            info["otc"] = json!(true);
        } else if is_cx {
            info["cx"] = json!(true);
        }
        if let Some(misc) = &cm.misc {
            for (k, v) in misc {
                info[k.as_str()] = json!(v);
            }
        }
        self.store.insert(PositionRow {
            user_id: ord.user_id,
            sub_account_id: ord.sub_account_id(),
            security_id: ord.security_id(),
            broker_account_id: ord.broker_account_id,
            qty: round6(pos.qty),
            cx_qty: round6(pos.cx_qty),
            avg_px: pos.avg_px,
            realized_pnl: pos.realized_pnl_native,
            commission: pos.commission_native,
            tm: crate::utils::now_str(),
            info: info.to_string(),
        });
    }

    /// Recompute unrealized PnL and account gross marks; append changed
    /// per-sub-account PnL lines every 15th tick. Runs on a 1 s cadence.
    pub fn update_pnl(&self, price_of: &dyn Fn(u32) -> f64) -> Vec<(u16, Pnl)> {
        let _guard = self.mutex.lock();
        for (positions, values) in [
            (&self.sub_positions, &self.sub_values),
            (&self.broker_positions, &self.broker_values),
            (&self.user_positions, &self.user_values),
        ] {
            let mut balances: HashMap<u16, (f64, f64)> = HashMap::new();
            for mut entry in positions.iter_mut() {
                let (acc, sec_id) = *entry.key();
                let Some(sec) = self.catalog.security(sec_id) else {
                    continue;
                };
                let price = price_of(sec_id);
                if price == 0.0 {
                    continue;
                }
                let pos = entry.value_mut();
                if pos.qty == 0.0 && pos.unrealized_pnl == 0.0 {
                    continue;
                }
                let m = sec.value_factor();
                pos.unrealized_pnl = pos.qty * (price - pos.avg_px) * m;
                let projected =
                    pos.qty + pos.total_outstanding_buy_qty - pos.total_outstanding_sell_qty;
                let bal = balances.entry(acc).or_default();
                if projected > 0.0 {
                    bal.0 += projected * price * m;
                } else {
                    bal.1 -= projected * price * m;
                }
            }
            for mut entry in values.iter_mut() {
                let bal = balances.get(entry.key()).copied().unwrap_or_default();
                entry.value_mut().long_value = bal.0;
                entry.value_mut().short_value = bal.1;
            }
        }

        let mut pnls: HashMap<u16, Pnl> = HashMap::new();
        for entry in self.sub_positions.iter() {
            let pnl = pnls.entry(entry.key().0).or_default();
            pnl.unrealized += entry.unrealized_pnl;
            pnl.commission += entry.commission;
            pnl.realized += entry.realized_pnl;
        }

        let tick = self.pnl_tick.fetch_add(1, Ordering::Relaxed);
        let mut out = Vec::with_capacity(pnls.len());
        if let Ok(mut tracks) = self.pnls.lock() {
            for (acc, pnl) in pnls {
                let track = tracks.entry(acc).or_default();
                track.current = pnl;
                if tick % 15 == 0
                    && (track.last_written.unrealized != pnl.unrealized
                        || track.last_written.realized != pnl.realized)
                {
                    self.append_pnl_line(acc, &pnl);
                    track.last_written = pnl;
                }
                out.push((acc, pnl));
            }
        }
        out
    }

    /// The latest computed PnL for one sub-account.
    pub fn pnl(&self, sub_account_id: u16) -> Pnl {
        self.pnls
            .lock()
            .ok()
            .and_then(|t| t.get(&sub_account_id).map(|t| t.current))
            .unwrap_or_default()
    }

    /// Read the persisted PnL time series (`tm unrealized commission
    /// realized` lines) for one sub-account.
    pub fn pnl_history(&self, sub_account_id: u16) -> Vec<(i64, Pnl)> {
        let path = self.store_dir.join(format!("pnl-{sub_account_id}"));
        let Ok(text) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for line in text.lines() {
            let mut cols = line.split_whitespace();
            let (Some(tm), Some(u), Some(c), Some(r)) =
                (cols.next(), cols.next(), cols.next(), cols.next())
            else {
                continue;
            };
            let (Ok(tm), Ok(unrealized), Ok(commission), Ok(realized)) =
                (tm.parse(), u.parse(), c.parse(), r.parse())
            else {
                continue;
            };
            out.push((
                tm,
                Pnl {
                    unrealized,
                    commission,
                    realized,
                },
            ));
        }
        out
    }

    fn append_pnl_line(&self, sub_account_id: u16, pnl: &Pnl) {
        let path = self.store_dir.join(format!("pnl-{sub_account_id}"));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut f) => {
                let _ = writeln!(
                    f,
                    "{} {} {} {}",
                    crate::utils::now_secs(),
                    pnl.unrealized,
                    pnl.commission,
                    pnl.realized
                );
            }
            Err(e) => warn!("failed to append {}: {e}", path.display()),
        }
    }

    /// Stop the store writer, draining queued rows.
    pub fn close(&self) {
        self.store.close();
    }
}
