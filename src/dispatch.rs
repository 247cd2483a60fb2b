//! Exchange-connectivity dispatch: the synchronous path from a validated
//! order intent to a broker adapter, and the inbound callback surface the
//! adapters drive from their I/O threads.

use crate::catalog::Catalog;
use crate::marketdata::MarketDataStore;
use crate::orderbook::{
    Confirmation, ExecTransType, OrdType, Order, OrderBook, OrderStatus,
};
use crate::risk::RiskGate;
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

/// An exchange-connectivity adapter. `place`/`cancel` return an empty
/// string for accepted or a human-readable error; transport state is
/// surfaced through `connected`.
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn connected(&self) -> bool;
    fn reconnect(&self) {}
    fn start(&self) {}
    fn place(&self, ord: &Order) -> String;
    fn cancel(&self, ord: &Order) -> String;
}

/// Routes validated orders to broker adapters and funnels their
/// confirmations back into the global order book.
pub struct ExchangeDispatch {
    catalog: Arc<Catalog>,
    book: Arc<OrderBook>,
    risk: Arc<RiskGate>,
    md: Arc<MarketDataStore>,
    adapters: DashMap<String, Arc<dyn ExchangeAdapter>>,
    // Timer pool for the randomized cancel-retry backoff; absent in
    // minimal test wiring, in which case breached cancels are not retried.
    runtime: OnceLock<tokio::runtime::Handle>,
}

impl ExchangeDispatch {
    pub fn new(
        catalog: Arc<Catalog>,
        book: Arc<OrderBook>,
        risk: Arc<RiskGate>,
        md: Arc<MarketDataStore>,
    ) -> Self {
        Self {
            catalog,
            book,
            risk,
            md,
            adapters: DashMap::new(),
            runtime: OnceLock::new(),
        }
    }

    /// Attach the shared timer pool used for cancel-retry scheduling.
    pub fn set_runtime(&self, handle: tokio::runtime::Handle) {
        let _ = self.runtime.set(handle);
    }

    pub fn add_adapter(&self, adapter: Arc<dyn ExchangeAdapter>) {
        info!("exchange connectivity adapter {} registered", adapter.name());
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.get(name).map(|a| a.clone())
    }

    pub fn adapters(&self) -> Vec<Arc<dyn ExchangeAdapter>> {
        self.adapters.iter().map(|a| a.value().clone()).collect()
    }

    fn reject(&self, order_id: u32, text: &str) {
        self.book
            .handle(Confirmation::status(order_id, OrderStatus::RiskRejected, text, 0));
    }

    /// Submit a new order. On success returns the allocated order id; every
    /// failure surfaces as a terminal `risk_rejected` confirmation and an
    /// `Err` with the same text.
    pub fn place(&self, mut ord: Order) -> Result<u32, String> {
        if ord.qty() <= 0.0 {
            return Err("Invalid order quantity".to_string());
        }
        if ord.ord_type() == OrdType::Cx {
            return Err("Cross orders are routed internally".to_string());
        }
        let sec = self
            .catalog
            .security(ord.security_id())
            .ok_or_else(|| "Unknown security".to_string())?;
        let sub = self
            .catalog
            .sub_account(ord.sub_account_id())
            .ok_or_else(|| "Unknown sub account".to_string())?;
        let user = self
            .catalog
            .user(ord.user_id)
            .ok_or_else(|| "Unknown user".to_string())?;

        ord.id = self.book.new_order_id();
        ord.status = OrderStatus::Unknown;
        self.book.insert(ord.clone());

        if !user.has_sub_account(sub.id) {
            let text = format!("Not permissioned to trade with sub account: {}", sub.name);
            self.reject(ord.id, &text);
            return Err(text);
        }
        let Some(broker_id) = sub.broker_account_for(sec.exchange_id) else {
            let exchange = self
                .catalog
                .exchange(sec.exchange_id)
                .map(|e| e.name.clone())
                .unwrap_or_else(|| sec.exchange_id.to_string());
            let text = format!("Not permissioned to trade on exchange: {exchange}");
            self.reject(ord.id, &text);
            return Err(text);
        };
        ord.broker_account_id = broker_id;

        if ord.ord_type() == OrdType::Otc {
            ord.leaves_qty = ord.qty();
            ord.tm = crate::utils::now_micros();
            self.book.insert(ord.clone());
            self.book.handle(Confirmation::status(
                ord.id,
                OrderStatus::UnconfirmedNew,
                "",
                ord.tm,
            ));
            self.book.handle(Confirmation::fill(
                ord.id,
                ord.qty(),
                ord.price(),
                format!("OTC-{}", ord.id),
                ExecTransType::New,
                0,
            ));
            return Ok(ord.id);
        }

        let broker = self
            .catalog
            .broker_account(broker_id)
            .ok_or_else(|| "Unknown broker account".to_string())?;
        let adapter = match self.check_adapter(&broker.adapter_name) {
            Ok(a) => a,
            Err(text) => {
                self.reject(ord.id, &text);
                return Err(text);
            }
        };

        if matches!(ord.ord_type(), OrdType::Market | OrdType::Stop) {
            if ord.price() <= 0.0 {
                ord.contract.price = self.md.current_price(&sec);
                if ord.price() <= 0.0 {
                    let text = "Can not find last price for this security".to_string();
                    self.reject(ord.id, &text);
                    return Err(text);
                }
            }
        } else if ord.price() <= 0.0 {
            let text = "Price can not be empty for limit order".to_string();
            self.reject(ord.id, &text);
            return Err(text);
        }

        if let Err(text) = self.risk.check(&ord) {
            self.reject(ord.id, &text);
            return Err(text);
        }

        ord.leaves_qty = ord.qty();
        ord.tm = crate::utils::now_micros();
        self.book.insert(ord.clone());
        self.book.handle(Confirmation::status(
            ord.id,
            OrderStatus::UnconfirmedNew,
            "",
            ord.tm,
        ));
        let err = adapter.place(&ord);
        if !err.is_empty() {
            self.reject(ord.id, &err);
            return Err(err);
        }
        self.update_throttles(&ord);
        Ok(ord.id)
    }

    /// Submit a cancel for a live order: a new order mirroring the original
    /// with `orig_id` set, running only the reduced message-rate risk path.
    pub fn cancel(self: &Arc<Self>, orig: &Order) -> Result<u32, String> {
        if !orig.is_live() {
            return Err("Order is not live".to_string());
        }
        let mut cancel_ord = orig.clone();
        cancel_ord.id = self.book.new_order_id();
        cancel_ord.orig_id = orig.id;
        cancel_ord.status = OrderStatus::Unknown;
        cancel_ord.cum_qty = 0.0;
        cancel_ord.avg_px = 0.0;
        cancel_ord.leaves_qty = 0.0;
        cancel_ord.tm = crate::utils::now_micros();
        self.book.insert(cancel_ord.clone());
        self.cancel_attempt(cancel_ord)
    }

    fn cancel_attempt(self: &Arc<Self>, mut ord: Order) -> Result<u32, String> {
        ord.tm = crate::utils::now_micros();
        if let Err(text) = self.risk.check_msg_rate(&ord) {
            self.reject(ord.id, &text);
            // Randomized 1-2 s backoff; correctness relies on eventual
            // drain, not on a retry cap.
            if let Some(handle) = self.runtime.get() {
                let this = self.clone();
                let delay = rand::thread_rng().gen_range(1000..2000);
                handle.spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let _ = this.cancel_attempt(ord);
                });
            } else {
                debug!("no timer pool attached, cancel {} not retried", ord.id);
            }
            return Err(text);
        }
        let broker = self
            .catalog
            .broker_account(ord.broker_account_id)
            .ok_or_else(|| "Unknown broker account".to_string())?;
        let adapter = match self.check_adapter(&broker.adapter_name) {
            Ok(a) => a,
            Err(text) => {
                self.reject(ord.id, &text);
                return Err(text);
            }
        };
        self.book.handle(Confirmation::status(
            ord.id,
            OrderStatus::UnconfirmedCancel,
            "",
            ord.tm,
        ));
        let err = adapter.cancel(&ord);
        if !err.is_empty() {
            self.reject(ord.id, &err);
            return Err(err);
        }
        self.update_throttles(&ord);
        Ok(ord.id)
    }

    /// Cancel every live order (graceful shutdown).
    pub fn cancel_all(self: &Arc<Self>) {
        for ord in self.book.live_orders() {
            if let Err(e) = self.cancel(&ord) {
                debug!("cancel-all: order {}: {e}", ord.id);
            }
        }
    }

    fn check_adapter(&self, name: &str) -> Result<Arc<dyn ExchangeAdapter>, String> {
        let Some(adapter) = self.adapter(name) else {
            return Err(format!(
                "Exchange connectivity adapter '{name}' is not started"
            ));
        };
        if !adapter.connected() {
            return Err(format!(
                "Exchange connectivity adapter '{name}' is disconnected"
            ));
        }
        Ok(adapter)
    }

    fn update_throttles(&self, ord: &Order) {
        let now = crate::utils::now_secs();
        if let Some(acc) = self.catalog.sub_account(ord.sub_account_id()) {
            acc.base.update_throttle(ord.security_id(), now);
        }
        if let Some(acc) = self.catalog.broker_account(ord.broker_account_id) {
            acc.base.update_throttle(ord.security_id(), now);
        }
        if let Some(user) = self.catalog.user(ord.user_id) {
            user.base.update_throttle(ord.security_id(), now);
        }
    }

    // ── Inbound surface, driven from adapter I/O threads ───────────────────

    /// Resolve the order a cancel-side callback targets: explicit orig id,
    /// else the referenced order's original, else the order itself.
    fn resolve_orig(&self, id: u32, orig_id: u32) -> Option<u32> {
        if orig_id != 0 {
            return Some(orig_id);
        }
        let ord = self.book.get(id)?;
        Some(if ord.orig_id != 0 { ord.orig_id } else { ord.id })
    }

    fn handle_status(&self, id: u32, exec_type: OrderStatus, desc: &str, text: &str, tm: i64) {
        if self.book.get(id).is_none() {
            debug!("unknown ClOrdId of {desc} confirmation: {id}, ignored");
            return;
        }
        self.book
            .handle(Confirmation::status(id, exec_type, text, tm));
    }

    pub fn handle_new(&self, id: u32, venue_order_id: &str, transaction_time: i64) {
        self.handle_status(id, OrderStatus::New, "new", venue_order_id, transaction_time);
    }

    pub fn handle_suspended(&self, id: u32, venue_order_id: &str, transaction_time: i64) {
        self.handle_status(
            id,
            OrderStatus::Suspended,
            "suspended",
            venue_order_id,
            transaction_time,
        );
    }

    pub fn handle_pending_new(&self, id: u32, text: &str, transaction_time: i64) {
        self.handle_status(id, OrderStatus::PendingNew, "pending new", text, transaction_time);
    }

    /// Fill callback with duplicate suppression and payload validation.
    pub fn handle_fill(
        &self,
        id: u32,
        qty: f64,
        price: f64,
        exec_id: &str,
        transaction_time: i64,
        is_partial: bool,
        exec_trans_type: ExecTransType,
        misc: Option<HashMap<String, String>>,
    ) {
        if self.book.is_dup_exec_id(id, exec_id) {
            debug!("duplicate exec id: {exec_id}, ignored");
            return;
        }
        if self.book.get(id).is_none() {
            debug!("unknown ClOrdId of fill confirmation: {id}, ignored");
            return;
        }
        if qty <= 0.0 || price <= 0.0 {
            debug!("invalid fill confirmation: {id}, qty={qty}, price={price}, ignored");
            return;
        }
        let mut cm = Confirmation::fill(id, qty, price, exec_id, exec_trans_type, transaction_time);
        if is_partial {
            cm.exec_type = OrderStatus::PartiallyFilled;
        }
        cm.misc = misc;
        self.book.handle(cm);
    }

    /// Synthetic fill entry for the internal cross engine (already knows
    /// the resting order id; exec ids still deduplicate).
    pub fn handle_filled(&self, order_id: u32, qty: f64, price: f64, exec_id: &str) {
        if self.book.is_dup_exec_id(order_id, exec_id) {
            debug!("duplicate exec id: {exec_id}, ignored");
            return;
        }
        self.book.handle(Confirmation::fill(
            order_id,
            qty,
            price,
            exec_id,
            ExecTransType::New,
            0,
        ));
    }

    pub fn handle_canceled(&self, id: u32, orig_id: u32, text: &str, transaction_time: i64) {
        let Some(target) = self.resolve_orig(id, orig_id) else {
            debug!("unknown ClOrdId of canceled confirmation: {id}, ignored");
            return;
        };
        self.handle_status(target, OrderStatus::Canceled, "canceled", text, transaction_time);
    }

    pub fn handle_new_rejected(&self, id: u32, text: &str, transaction_time: i64) {
        self.handle_status(id, OrderStatus::Rejected, "rejected", text, transaction_time);
    }

    pub fn handle_cancel_rejected(&self, id: u32, orig_id: u32, text: &str, transaction_time: i64) {
        let Some(target) = self.resolve_orig(id, orig_id) else {
            debug!("unknown ClOrdId of cancel rejected confirmation: {id}, ignored");
            return;
        };
        self.handle_status(
            target,
            OrderStatus::CancelRejected,
            "cancel rejected",
            text,
            transaction_time,
        );
    }

    pub fn handle_pending_cancel(&self, id: u32, orig_id: u32, transaction_time: i64) {
        let Some(target) = self.resolve_orig(id, orig_id) else {
            debug!("unknown ClOrdId of pending cancel confirmation: {id}, ignored");
            return;
        };
        self.handle_status(
            target,
            OrderStatus::PendingCancel,
            "pending cancel",
            "",
            transaction_time,
        );
    }

    /// Expired, done-for-day, calculated and other venue-driven statuses.
    pub fn handle_others(&self, id: u32, exec_type: OrderStatus, text: &str, transaction_time: i64) {
        self.handle_status(id, exec_type, "status", text, transaction_time);
    }
}
